//! Optimization policy types

use serde::{Deserialize, Serialize};

use crate::telemetry::DeviceThresholds;

/// User or policy selected optimization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    Performance,
    #[default]
    Balanced,
    BatterySaver,
    MemorySaver,
}

/// Thresholds the policy engine evaluates telemetry against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyThresholds {
    /// At or below this (and not charging) inference is blocked
    pub critical_battery_percent: u8,
    /// Below this (and not charging) generation is throttled
    pub low_battery_percent: u8,
    /// Available RAM below this raises a low-memory advisory
    pub low_memory_mb: u64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            critical_battery_percent: 10,
            low_battery_percent: 20,
            low_memory_mb: 1024,
        }
    }
}

impl PolicyThresholds {
    /// Flags on telemetry snapshots use the same low thresholds as the policy
    pub fn device_thresholds(&self) -> DeviceThresholds {
        DeviceThresholds {
            low_memory_mb: self.low_memory_mb,
            low_battery_percent: self.low_battery_percent,
        }
    }
}

/// Process-wide optimization configuration, written only by the policy engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OptimizationConfig {
    pub mode: OptimizationMode,
    #[serde(flatten)]
    pub thresholds: PolicyThresholds,
}

/// Parameters handed to the generation engine
///
/// `context_length` is a load-time parameter; the rest apply per generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub context_length: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            context_length: 2048,
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
        }
    }
}

impl GenerationConfig {
    /// Same sampling, half the context and output budget
    pub fn halved(&self) -> Self {
        Self {
            context_length: (self.context_length / 2).max(1),
            max_tokens: (self.max_tokens / 2).max(1),
            ..self.clone()
        }
    }
}

/// Edge-triggered policy events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PolicyEvent {
    InferenceBlocked { battery_percent: u8 },
    InferenceUnblocked,
    ThrottleEngaged { battery_percent: u8 },
    ThrottleReleased,
    LowMemory { available_mb: u64 },
    MemoryRecovered { available_mb: u64 },
    RecommendedConfigChanged { config: GenerationConfig },
}
