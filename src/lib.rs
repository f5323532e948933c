// Model Lifecycle - resource-aware on-device LLM management
//
// Keeps exactly one model resident, adapts generation settings to battery and
// memory pressure, and downloads models from a remote catalog:
// - Device telemetry polling (memory, battery)
// - Model catalog (bundled, downloaded, remote-only)
// - Download coordination with per-model dedup and cancellation
// - Single-slot load/unload/generate state machine
// - Optimization policy driven by telemetry

// Hot-path logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

// Core modules
pub mod catalog;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod lifecycle;
pub mod policy;
pub mod settings;
pub mod state;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::ManagerConfig;
pub use error::{LifecycleError, Result};
pub use estimator::{check_compatibility, estimate_required_ram_mb, Compatibility};
pub use lifecycle::{GenerationStream, ModelLifecycleController, SlotState, SlotStatus};
pub use state::{AppState, Components, StatusReport};

/// Initialize env_logger on stderr (reads RUST_LOG, defaults to info)
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
