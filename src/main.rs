//! Status binary
//!
//! Usage: `model-lifecycle [config.json]`
//!
//! Samples device telemetry once, scans the model catalog and prints a JSON
//! report of device status, per-model compatibility and the recommended model.

use std::path::PathBuf;

use anyhow::{Context, Result};
use model_lifecycle::{init_logging, AppState, ManagerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => ManagerConfig::load(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    log::info!("Models directory: {}", config.models_dir.display());

    let state = AppState::new(config)
        .await
        .context("failed to build lifecycle manager")?;
    let ready = state.catalog.initialize().await?;
    log::info!("{} models ready", ready);

    if let Err(e) = state.monitor.refresh().await {
        log::warn!("Telemetry unavailable: {}", e);
    }
    if let Ok(status) = state.monitor.current_status() {
        state.policy.evaluate(&status);
    }

    let report = state.report().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
