//! Device telemetry types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    Charging,
    Discharging,
    Full,
    Unknown,
}

impl BatteryState {
    /// Plugged in: charging, or full and held at 100% by the charger
    pub fn is_plugged_in(self) -> bool {
        matches!(self, BatteryState::Charging | BatteryState::Full)
    }
}

/// Raw memory reading from a telemetry source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total_mb: u64,
    pub available_mb: u64,
}

/// Raw battery reading from a telemetry source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    pub percent: u8,
    pub state: BatteryState,
}

/// Thresholds used to derive the low-memory / low-battery flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceThresholds {
    pub low_memory_mb: u64,
    pub low_battery_percent: u8,
}

impl Default for DeviceThresholds {
    fn default() -> Self {
        Self {
            low_memory_mb: 1024,
            low_battery_percent: 20,
        }
    }
}

/// Immutable snapshot of device resources at one poll
///
/// `available_ram_mb` is an estimate. Operating systems do not expose a
/// reliable figure for "memory a new allocation could get", so treat it
/// as a heuristic rather than ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub total_ram_mb: u64,
    pub available_ram_mb: u64,
    pub battery_percent: u8,
    pub battery_state: BatteryState,
    pub is_low_memory: bool,
    pub is_low_battery: bool,
    pub is_charging: bool,
    pub captured_at: DateTime<Utc>,
}

impl DeviceStatus {
    pub fn from_readings(
        memory: MemoryReading,
        battery: BatteryReading,
        thresholds: &DeviceThresholds,
    ) -> Self {
        let battery_percent = battery.percent.min(100);
        Self {
            total_ram_mb: memory.total_mb,
            available_ram_mb: memory.available_mb,
            battery_percent,
            battery_state: battery.state,
            is_low_memory: memory.available_mb < thresholds.low_memory_mb,
            is_low_battery: battery_percent < thresholds.low_battery_percent,
            is_charging: battery.state.is_plugged_in(),
            captured_at: Utc::now(),
        }
    }

    /// Same readings, ignoring capture time
    pub fn same_reading(&self, other: &DeviceStatus) -> bool {
        self.total_ram_mb == other.total_ram_mb
            && self.available_ram_mb == other.available_ram_mb
            && self.battery_percent == other.battery_percent
            && self.battery_state == other.battery_state
    }
}
