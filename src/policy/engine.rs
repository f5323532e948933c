//! Optimization policy engine
//!
//! Consumes telemetry snapshots in arrival order and turns three independent
//! conditions (critical battery, low battery, low memory) into edge-triggered
//! events. The engine is the single writer of the `OptimizationConfig`;
//! everyone else reads it through a watch channel.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::profiles::{is_battery_critical, is_battery_low, is_memory_low, recommended_config};
use super::types::{GenerationConfig, OptimizationConfig, OptimizationMode, PolicyEvent};
use crate::telemetry::{DeviceStatus, DeviceTelemetryMonitor};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct PolicyState {
    blocked: bool,
    throttled: bool,
    low_memory: bool,
    last_status: Option<DeviceStatus>,
    recommended: GenerationConfig,
}

pub struct OptimizationPolicyEngine {
    config: watch::Sender<OptimizationConfig>,
    state: Mutex<PolicyState>,
    events: broadcast::Sender<PolicyEvent>,
    attached: Mutex<Option<CancellationToken>>,
}

impl OptimizationPolicyEngine {
    pub fn new(config: OptimizationConfig) -> Self {
        let (config_tx, _) = watch::channel(config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = PolicyState {
            recommended: recommended_config(config.mode, None, &config.thresholds),
            ..PolicyState::default()
        };

        Self {
            config: config_tx,
            state: Mutex::new(state),
            events,
            attached: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, PolicyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }

    /// Read-only view of the optimization config
    pub fn watch_config(&self) -> watch::Receiver<OptimizationConfig> {
        self.config.subscribe()
    }

    pub fn config(&self) -> OptimizationConfig {
        *self.config.borrow()
    }

    /// Replace the optimization config and re-evaluate against the last snapshot
    pub fn reconfigure(&self, config: OptimizationConfig) -> Vec<PolicyEvent> {
        info!("Optimization config changed: {:?}", config);
        // Published under the state lock so evaluate never mixes old and new thresholds
        let mut state = self.state();
        self.config.send_replace(config);

        let last = state.last_status.clone();
        self.apply(&mut state, last.as_ref(), &config)
    }

    pub fn set_mode(&self, mode: OptimizationMode) -> Vec<PolicyEvent> {
        let config = OptimizationConfig {
            mode,
            ..self.config()
        };
        self.reconfigure(config)
    }

    /// Process one telemetry snapshot, returning the events it fired
    ///
    /// Snapshots are taken in arrival order; capture timestamps are wall
    /// clock and may step backwards.
    pub fn evaluate(&self, status: &DeviceStatus) -> Vec<PolicyEvent> {
        let mut state = self.state();
        let config = self.config();

        state.last_status = Some(status.clone());
        self.apply(&mut state, Some(status), &config)
    }

    fn apply(
        &self,
        state: &mut PolicyState,
        status: Option<&DeviceStatus>,
        config: &OptimizationConfig,
    ) -> Vec<PolicyEvent> {
        let mut fired = Vec::new();

        if let Some(status) = status {
            let blocked = is_battery_critical(status, &config.thresholds);
            if blocked != state.blocked {
                state.blocked = blocked;
                if blocked {
                    warn!("Battery critical ({}%), blocking inference", status.battery_percent);
                    fired.push(PolicyEvent::InferenceBlocked {
                        battery_percent: status.battery_percent,
                    });
                } else {
                    info!("Battery recovered, inference unblocked");
                    fired.push(PolicyEvent::InferenceUnblocked);
                }
            }

            let throttled = is_battery_low(status, &config.thresholds);
            if throttled != state.throttled {
                state.throttled = throttled;
                if throttled {
                    info!("Battery low ({}%), throttling generation", status.battery_percent);
                    fired.push(PolicyEvent::ThrottleEngaged {
                        battery_percent: status.battery_percent,
                    });
                } else {
                    info!("Battery no longer low, throttle released");
                    fired.push(PolicyEvent::ThrottleReleased);
                }
            }

            let low_memory = is_memory_low(status, &config.thresholds);
            if low_memory != state.low_memory {
                state.low_memory = low_memory;
                if low_memory {
                    warn!("Low memory: {} MB available", status.available_ram_mb);
                    fired.push(PolicyEvent::LowMemory {
                        available_mb: status.available_ram_mb,
                    });
                } else {
                    info!("Memory recovered: {} MB available", status.available_ram_mb);
                    fired.push(PolicyEvent::MemoryRecovered {
                        available_mb: status.available_ram_mb,
                    });
                }
            }
        }

        let recommended = recommended_config(config.mode, status, &config.thresholds);
        if recommended != state.recommended {
            info!(
                "Recommended generation config: context {} / max tokens {}",
                recommended.context_length, recommended.max_tokens
            );
            state.recommended = recommended.clone();
            fired.push(PolicyEvent::RecommendedConfigChanged { config: recommended });
        }

        // Sent under the state lock so subscribers see events in evaluation order
        for event in &fired {
            let _ = self.events.send(event.clone());
        }
        fired
    }

    /// False only while the battery is critical and not charging
    pub fn should_allow_inference(&self) -> bool {
        !self.state().blocked
    }

    pub fn is_throttled(&self) -> bool {
        self.state().throttled
    }

    pub fn is_low_memory(&self) -> bool {
        self.state().low_memory
    }

    /// Generation config recommended for the current mode and telemetry
    pub fn current_config(&self) -> GenerationConfig {
        self.state().recommended.clone()
    }

    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.state().last_status.clone()
    }

    /// Follow a telemetry monitor's stream until `detach` is called
    pub fn attach(self: &Arc<Self>, monitor: &DeviceTelemetryMonitor) -> JoinHandle<()> {
        let token = CancellationToken::new();
        {
            let mut attached = match self.attached.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(previous) = attached.replace(token.clone()) {
                previous.cancel();
            }
        }

        let mut rx = monitor.subscribe();
        if let Ok(status) = monitor.current_status() {
            self.evaluate(&status);
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(status) => {
                            engine.evaluate(&status);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Policy engine lagged, skipped {} telemetry snapshots", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("Policy engine detached from telemetry");
        })
    }

    pub fn detach(&self) {
        let mut attached = match self.attached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(token) = attached.take() {
            token.cancel();
        }
    }
}
