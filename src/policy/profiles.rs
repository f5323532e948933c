//! Generation profiles per optimization mode

use super::types::{GenerationConfig, OptimizationMode, PolicyThresholds};
use crate::telemetry::DeviceStatus;

/// Battery at or below the critical threshold and not on a charger
pub fn is_battery_critical(status: &DeviceStatus, thresholds: &PolicyThresholds) -> bool {
    !status.is_charging && status.battery_percent <= thresholds.critical_battery_percent
}

/// Battery below the low threshold and not on a charger
pub fn is_battery_low(status: &DeviceStatus, thresholds: &PolicyThresholds) -> bool {
    !status.is_charging && status.battery_percent < thresholds.low_battery_percent
}

pub fn is_memory_low(status: &DeviceStatus, thresholds: &PolicyThresholds) -> bool {
    status.available_ram_mb < thresholds.low_memory_mb
}

fn performance() -> GenerationConfig {
    GenerationConfig {
        context_length: 4096,
        max_tokens: 1024,
        top_p: 0.95,
        ..GenerationConfig::default()
    }
}

fn battery_saver() -> GenerationConfig {
    GenerationConfig {
        context_length: 1024,
        max_tokens: 256,
        top_k: 30,
        ..GenerationConfig::default()
    }
}

fn memory_saver() -> GenerationConfig {
    GenerationConfig {
        context_length: 512,
        max_tokens: 256,
        top_k: 30,
        ..GenerationConfig::default()
    }
}

/// Recommended generation parameters for a mode and the latest telemetry
///
/// Only `Balanced` adapts to live conditions: low battery (not charging) or
/// low memory halves its context and output budget. The other modes are
/// fixed profiles the user opted into. Without telemetry the unadjusted
/// profile is returned.
pub fn recommended_config(
    mode: OptimizationMode,
    status: Option<&DeviceStatus>,
    thresholds: &PolicyThresholds,
) -> GenerationConfig {
    match mode {
        OptimizationMode::Performance => performance(),
        OptimizationMode::BatterySaver => battery_saver(),
        OptimizationMode::MemorySaver => memory_saver(),
        OptimizationMode::Balanced => {
            let constrained = status
                .map(|s| is_battery_low(s, thresholds) || is_memory_low(s, thresholds))
                .unwrap_or(false);
            if constrained {
                GenerationConfig::default().halved()
            } else {
                GenerationConfig::default()
            }
        }
    }
}
