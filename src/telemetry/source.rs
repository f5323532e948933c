//! Telemetry sources
//!
//! `TelemetrySource` is the seam to the operating system. The default
//! implementation reads memory through `sysinfo` and the battery through
//! the Linux power-supply class; other platforms report an unknown battery.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info};
use sysinfo::System;

use super::types::{BatteryReading, BatteryState, MemoryReading};
use crate::error::{LifecycleError, Result};

const BYTES_PER_MB: u64 = 1024 * 1024;

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn memory(&self) -> Result<MemoryReading>;

    async fn battery(&self) -> Result<BatteryReading>;

    /// Device model identifier, used for the RAM heuristic fallback
    fn device_model(&self) -> Option<String> {
        None
    }
}

/// Rough installed RAM for known device families when the OS reports none
///
/// Lossy by nature: it only knows coarse families and answers with the
/// smallest configuration shipped for each.
pub fn estimate_total_ram_mb(device_model: &str) -> u64 {
    let model = device_model.to_lowercase();
    if model.contains("iphone16") || model.contains("iphone 16") {
        8192
    } else if model.contains("iphone15") || model.contains("iphone 15") {
        6144
    } else if model.contains("iphone") {
        4096
    } else if model.contains("ipad") {
        8192
    } else if model.contains("pixel") {
        8192
    } else {
        4096
    }
}

/// Reads memory through sysinfo and battery through the power-supply class
pub struct SystemTelemetrySource {
    system: Mutex<System>,
    power_supply_dir: PathBuf,
    device_model: Option<String>,
}

impl SystemTelemetrySource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
            device_model: Self::detect_device_model(),
        }
    }

    /// Read the battery from a custom power-supply directory
    pub fn with_power_supply_dir(mut self, dir: PathBuf) -> Self {
        self.power_supply_dir = dir;
        self
    }

    fn detect_device_model() -> Option<String> {
        let model = std::fs::read_to_string("/sys/devices/virtual/dmi/id/product_name")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(ref m) = model {
            info!("Detected device model: {}", m);
        }
        model
    }

    async fn read_battery_dir(&self) -> Option<BatteryReading> {
        let mut entries = tokio::fs::read_dir(&self.power_supply_dir).await.ok()?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let kind = tokio::fs::read_to_string(path.join("type"))
                .await
                .unwrap_or_default();
            if kind.trim() != "Battery" {
                continue;
            }

            let percent = tokio::fs::read_to_string(path.join("capacity"))
                .await
                .ok()
                .and_then(|s| s.trim().parse::<u8>().ok())?;
            let state = tokio::fs::read_to_string(path.join("status"))
                .await
                .map(|s| parse_battery_state(&s))
                .unwrap_or(BatteryState::Unknown);

            return Some(BatteryReading {
                percent: percent.min(100),
                state,
            });
        }

        None
    }
}

impl Default for SystemTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_battery_state(raw: &str) -> BatteryState {
    match raw.trim().to_lowercase().as_str() {
        "charging" => BatteryState::Charging,
        "discharging" | "not charging" => BatteryState::Discharging,
        "full" => BatteryState::Full,
        _ => BatteryState::Unknown,
    }
}

#[async_trait]
impl TelemetrySource for SystemTelemetrySource {
    async fn memory(&self) -> Result<MemoryReading> {
        let (total, available) = {
            let mut sys = self
                .system
                .lock()
                .map_err(|_| LifecycleError::DeviceQueryFailed("memory reader poisoned".to_string()))?;
            sys.refresh_memory();
            (sys.total_memory(), sys.available_memory())
        };

        let total_mb = if total > 0 {
            total / BYTES_PER_MB
        } else {
            let model = self.device_model.as_deref().ok_or_else(|| {
                LifecycleError::DeviceQueryFailed("total memory unavailable".to_string())
            })?;
            estimate_total_ram_mb(model)
        };

        // Without an availability figure, assume half of total is usable
        let available_mb = if available > 0 {
            available / BYTES_PER_MB
        } else {
            total_mb / 2
        };

        debug!("Memory reading: {} MB available of {} MB", available_mb, total_mb);
        Ok(MemoryReading {
            total_mb,
            available_mb: available_mb.min(total_mb),
        })
    }

    async fn battery(&self) -> Result<BatteryReading> {
        // No battery (desktop on mains power) reads as full with unknown state
        Ok(self.read_battery_dir().await.unwrap_or(BatteryReading {
            percent: 100,
            state: BatteryState::Unknown,
        }))
    }

    fn device_model(&self) -> Option<String> {
        self.device_model.clone()
    }
}
