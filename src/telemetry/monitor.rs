//! Device telemetry monitor
//!
//! Polls a `TelemetrySource` on a fixed interval, re-samples immediately when
//! the platform reports a battery-state change, and broadcasts every new
//! snapshot to any number of subscribers. A failed poll keeps the last good
//! snapshot so downstream consumers never stall on telemetry errors.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;

use super::source::TelemetrySource;
use super::types::{DeviceStatus, DeviceThresholds};
use crate::error::{LifecycleError, Result};

const STATUS_CHANNEL_CAPACITY: usize = 64;

struct Sampler {
    source: Arc<dyn TelemetrySource>,
    thresholds: DeviceThresholds,
    latest: watch::Sender<Option<DeviceStatus>>,
    updates: broadcast::Sender<DeviceStatus>,
}

impl Sampler {
    async fn sample(&self) -> Result<DeviceStatus> {
        let memory = self.source.memory().await?;
        let battery = self.source.battery().await?;
        let status = DeviceStatus::from_readings(memory, battery, &self.thresholds);

        let duplicate = self
            .latest
            .borrow()
            .as_ref()
            .map(|previous| previous.same_reading(&status))
            .unwrap_or(false);
        if duplicate {
            debug!("Telemetry unchanged, not re-broadcasting");
            return Ok(status);
        }

        crate::perf_debug!(
            "Telemetry: {} MB free of {} MB, battery {}% ({:?})",
            status.available_ram_mb, status.total_ram_mb, status.battery_percent, status.battery_state
        );
        self.latest.send_replace(Some(status.clone()));
        // No subscribers is fine
        let _ = self.updates.send(status.clone());
        Ok(status)
    }
}

pub struct DeviceTelemetryMonitor {
    sampler: Arc<Sampler>,
    poll_interval: Duration,
    resample: Arc<Notify>,
    running: Mutex<Option<CancellationToken>>,
}

impl DeviceTelemetryMonitor {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        thresholds: DeviceThresholds,
        poll_interval: Duration,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        let (updates, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Self {
            sampler: Arc::new(Sampler {
                source,
                thresholds,
                latest,
                updates,
            }),
            poll_interval,
            resample: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    /// Begin polling. Calling `start` on a running monitor does nothing.
    pub fn start(&self) {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());

        let sampler = self.sampler.clone();
        let resample = self.resample.clone();
        let interval = self.poll_interval;

        tokio::spawn(async move {
            info!("Telemetry monitor started (interval {:?})", interval);
            loop {
                if let Err(e) = sampler.sample().await {
                    warn!("Telemetry poll failed, keeping last snapshot: {}", e);
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = resample.notified() => {
                        debug!("Battery state changed, re-sampling");
                    }
                }
            }
            info!("Telemetry monitor stopped");
        });
    }

    pub fn stop(&self) {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(token) = running.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        match self.running.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Platform hook for native battery-state-change notifications
    pub fn notify_battery_changed(&self) {
        self.resample.notify_one();
    }

    /// Stream of snapshots in capture order
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceStatus> {
        self.sampler.updates.subscribe()
    }

    /// Latest snapshot as a watch value
    pub fn watch(&self) -> watch::Receiver<Option<DeviceStatus>> {
        self.sampler.latest.subscribe()
    }

    /// Most recent snapshot, failing if no poll has completed yet
    pub fn current_status(&self) -> Result<DeviceStatus> {
        self.sampler
            .latest
            .borrow()
            .clone()
            .ok_or(LifecycleError::StatusNotYetAvailable)
    }

    /// Sample immediately outside the polling schedule
    pub async fn refresh(&self) -> Result<DeviceStatus> {
        match self.sampler.sample().await {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!("Telemetry refresh failed: {}", e);
                Err(e)
            }
        }
    }
}

impl Drop for DeviceTelemetryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
