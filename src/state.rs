//! Application state
//!
//! Wires the components together and owns the task that carries policy
//! decisions into the lifecycle controller. Policy events are advisory: a
//! recommended config that arrives while the slot is busy is kept and applied
//! the next time the slot settles.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::catalog::{
    known_models, HuggingFaceCatalog, ModelCatalog, ModelDescriptor, Provenance, RemoteCatalog,
};
use crate::config::ManagerConfig;
use crate::download::{DownloadCoordinator, DownloadHandle, HttpTransport, Transport};
use crate::engine::{GenerationEngine, SidecarConfig, SidecarEngine};
use crate::error::{LifecycleError, Result};
use crate::estimator::Compatibility;
use crate::lifecycle::{ModelLifecycleController, SlotState, SlotStatus};
use crate::policy::{GenerationConfig, OptimizationMode, OptimizationPolicyEngine, PolicyEvent};
use crate::settings::SettingsStore;
use crate::telemetry::{DeviceStatus, DeviceTelemetryMonitor, SystemTelemetrySource, TelemetrySource};

/// Swappable collaborators; production values come from `AppState::new`
pub struct Components {
    pub telemetry: Arc<dyn TelemetrySource>,
    pub remote: Arc<dyn RemoteCatalog>,
    pub transport: Arc<dyn Transport>,
    pub engine: Arc<dyn GenerationEngine>,
    pub known_models: Vec<ModelDescriptor>,
}

/// One catalog entry with its fit on this device
#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    pub compatibility: Compatibility,
}

/// Snapshot of the whole manager, printed by the status binary
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub device: Option<DeviceStatus>,
    pub slot: SlotStatus,
    pub inference_allowed: bool,
    pub generation_config: GenerationConfig,
    pub recommended_model: Option<String>,
    pub models: Vec<ModelReport>,
}

pub struct AppState {
    pub config: ManagerConfig,
    pub monitor: Arc<DeviceTelemetryMonitor>,
    pub policy: Arc<OptimizationPolicyEngine>,
    pub catalog: Arc<ModelCatalog>,
    pub downloads: Arc<DownloadCoordinator>,
    pub lifecycle: Arc<ModelLifecycleController>,
    pub settings: Arc<SettingsStore>,
    bridge: Mutex<Option<CancellationToken>>,
}

impl AppState {
    /// Production wiring: sysinfo telemetry, HuggingFace catalog, HTTP, sidecar engine
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        let components = Components {
            telemetry: Arc::new(SystemTelemetrySource::new()),
            remote: Arc::new(HuggingFaceCatalog::new(config.remote_base_url.clone())?),
            transport: Arc::new(HttpTransport::new()?),
            engine: Arc::new(SidecarEngine::new(SidecarConfig {
                sidecar_path: config.sidecar_path.clone(),
            })),
            known_models: known_models(),
        };
        Ok(Self::with_components(config, components).await)
    }

    pub async fn with_components(config: ManagerConfig, components: Components) -> Self {
        let monitor = Arc::new(DeviceTelemetryMonitor::new(
            components.telemetry,
            config.device_thresholds(),
            config.telemetry.poll_interval(),
        ));
        let policy = Arc::new(OptimizationPolicyEngine::new(config.optimization));
        let catalog = Arc::new(
            ModelCatalog::new(
                config.models_dir.clone(),
                config.bundled_dir.clone(),
                components.known_models,
                components.remote,
            )
            .with_tiers(config.recommendation),
        );
        let downloads = Arc::new(DownloadCoordinator::new(catalog.clone(), components.transport));
        let lifecycle = Arc::new(ModelLifecycleController::new(
            components.engine,
            catalog.clone(),
            policy.clone(),
        ));
        let settings = Arc::new(SettingsStore::open(config.settings_path.clone()).await);

        Self {
            config,
            monitor,
            policy,
            catalog,
            downloads,
            lifecycle,
            settings,
            bridge: Mutex::new(None),
        }
    }

    /// Scan the catalog, take a first sample and start the background tasks
    ///
    /// Returns the number of ready models.
    pub async fn start(&self) -> Result<usize> {
        let ready = self.catalog.initialize().await?;

        if let Err(e) = self.monitor.refresh().await {
            warn!("Initial telemetry sample failed: {}", e);
        }
        self.monitor.start();
        self.policy.attach(&self.monitor);
        self.spawn_bridge();

        info!("Model lifecycle manager started with {} ready models", ready);
        Ok(ready)
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(token) = self.bridge_slot().take() {
            token.cancel();
        }
        self.policy.detach();
        self.monitor.stop();
        self.downloads.cancel_all();
        self.lifecycle.shutdown().await?;
        info!("Model lifecycle manager stopped");
        Ok(())
    }

    fn bridge_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        match self.bridge.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Forward policy decisions to the lifecycle controller
    fn spawn_bridge(&self) {
        let token = CancellationToken::new();
        {
            let mut slot = self.bridge_slot();
            if slot.is_some() {
                return;
            }
            *slot = Some(token.clone());
        }

        let mut events = self.policy.subscribe();
        let mut slot_changes = self.lifecycle.subscribe();
        let lifecycle = self.lifecycle.clone();
        let policy = self.policy.clone();
        let unload_on_low_memory = self.config.unload_on_low_memory;

        tokio::spawn(async move {
            // Telemetry may have moved the policy before we subscribed
            let mut pending_config = Some(policy.current_config());
            let mut pending_unload = unload_on_low_memory && policy.is_low_memory();

            loop {
                apply_pending(&lifecycle, &mut pending_config, &mut pending_unload).await;

                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(PolicyEvent::RecommendedConfigChanged { config }) => {
                            pending_config = Some(config);
                        }
                        Ok(PolicyEvent::LowMemory { available_mb }) if unload_on_low_memory => {
                            info!("Low memory ({} MB), unloading model when idle", available_mb);
                            pending_unload = true;
                        }
                        Ok(PolicyEvent::MemoryRecovered { .. }) => {
                            pending_unload = false;
                        }
                        Ok(event) => debug!("Policy event: {:?}", event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Policy bridge lagged, skipped {} events", skipped);
                            pending_config = Some(policy.current_config());
                            pending_unload = unload_on_low_memory && policy.is_low_memory();
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = slot_changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Policy bridge stopped");
        });
    }

    /// Load a model and remember it as the last selection
    pub async fn select_model(&self, id: &str) -> Result<()> {
        self.lifecycle.load_model(id).await?;
        self.settings.set_last_selected_model(id).await
    }

    /// Reload the last selected model if it is still on disk
    pub async fn restore_last_selected(&self) -> Result<Option<String>> {
        let Some(id) = self.settings.last_selected_model().await else {
            return Ok(None);
        };
        if self.catalog.model_path(&id).await.is_none() {
            info!("Last selected model {} is no longer available", id);
            return Ok(None);
        }

        self.lifecycle.load_model(&id).await?;
        Ok(Some(id))
    }

    /// Start downloading a catalog model
    pub async fn download_model(&self, id: &str) -> Result<DownloadHandle> {
        let descriptor = self.catalog.require(id).await?;
        self.downloads.start(&descriptor)
    }

    /// Remove a downloaded model, unloading it first when resident
    pub async fn delete_model(&self, id: &str) -> Result<ModelDescriptor> {
        let descriptor = self.catalog.require(id).await?;
        if descriptor.provenance == Provenance::Bundled {
            return Err(LifecycleError::NotRemovable(id.to_string()));
        }
        if let Some(key) = descriptor.download_key() {
            if self.downloads.is_active(&key) {
                return Err(LifecycleError::Busy(format!("{} is downloading", id)));
            }
        }

        if self.lifecycle.loaded_model_id().as_deref() == Some(id) {
            self.lifecycle.unload_model().await?;
        }

        let reverted = self.catalog.remove_download(id).await?;
        if self.settings.last_selected_model().await.as_deref() == Some(id) {
            self.settings.remove(crate::settings::LAST_SELECTED_MODEL_KEY).await?;
        }
        Ok(reverted)
    }

    pub fn set_mode(&self, mode: OptimizationMode) -> Vec<PolicyEvent> {
        self.policy.set_mode(mode)
    }

    fn latest_status(&self) -> Option<DeviceStatus> {
        self.monitor
            .current_status()
            .ok()
            .or_else(|| self.policy.last_status())
    }

    /// Fit of a model against the latest device snapshot
    ///
    /// Without any snapshot the answer is `Marginal`, never `Compatible`.
    pub async fn compatibility(&self, id: &str) -> Result<Compatibility> {
        let descriptor = self.catalog.require(id).await?;
        Ok(self.compatibility_of(&descriptor))
    }

    fn compatibility_of(&self, descriptor: &ModelDescriptor) -> Compatibility {
        match self.latest_status() {
            Some(status) => self
                .config
                .compatibility
                .check(descriptor.required_ram_mb, status.available_ram_mb),
            None => Compatibility::Marginal,
        }
    }

    /// Default model for this device
    pub async fn recommended_model(&self) -> Result<String> {
        // Without telemetry, fall back to the smallest ready model
        let device_ram_mb = self.latest_status().map(|s| s.total_ram_mb).unwrap_or(0);
        self.catalog.recommended_id(device_ram_mb).await
    }

    pub async fn report(&self) -> StatusReport {
        let models = self
            .catalog
            .list_all()
            .await
            .into_iter()
            .map(|descriptor| ModelReport {
                compatibility: self.compatibility_of(&descriptor),
                descriptor,
            })
            .collect();

        StatusReport {
            device: self.latest_status(),
            slot: self.lifecycle.status(),
            inference_allowed: self.policy.should_allow_inference(),
            generation_config: self.lifecycle.config(),
            recommended_model: self.recommended_model().await.ok(),
            models,
        }
    }
}

async fn apply_pending(
    lifecycle: &ModelLifecycleController,
    pending_config: &mut Option<GenerationConfig>,
    pending_unload: &mut bool,
) {
    if let Some(config) = pending_config.clone() {
        if lifecycle.config() == config {
            *pending_config = None;
        } else {
            match lifecycle.update_config(config).await {
                Ok(()) => *pending_config = None,
                Err(LifecycleError::Busy(_)) => debug!("Slot busy, config change deferred"),
                Err(e) => {
                    warn!("Failed to apply recommended config: {}", e);
                    *pending_config = None;
                }
            }
        }
    }

    if *pending_unload {
        match lifecycle.state() {
            SlotState::Empty => *pending_unload = false,
            SlotState::Ready | SlotState::Error => match lifecycle.unload_model().await {
                Ok(()) => {
                    info!("Model unloaded after low-memory advisory");
                    *pending_unload = false;
                }
                Err(e) => {
                    warn!("Low-memory unload failed: {}", e);
                    *pending_unload = false;
                }
            },
            _ => debug!("Slot busy, low-memory unload deferred"),
        }
    }
}
