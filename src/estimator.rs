//! RAM compatibility estimation
//!
//! Pure functions that map a model file's size and quantization to the RAM
//! it needs once loaded, and a (required, available) pair to a
//! compatibility tier. These gate what the lifecycle controller and the UI
//! will offer, so everything here is deterministic and side-effect free.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Multiplier used when the quantization label cannot be parsed
pub const UNKNOWN_QUANT_MULTIPLIER: f64 = 1.8;

/// Integer quantizations: Q4_K_M, IQ4_XS, Q8_0, q5_1 ...
static INT_QUANT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[-_.\s])(I?Q([1-8])(?:_[A-Z0-9]+)*)(?:$|[-.\s])").expect("valid regex")
});

/// Float formats: F16, BF16, FP16, F32, FP32
static FLOAT_QUANT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[-_.\s])((?:B?F|FP)(16|32))(?:$|[-_.\s])").expect("valid regex")
});

/// Extract the weight bit-width from a quantization label or file name
pub fn quantization_bits(label: &str) -> Option<u32> {
    INT_QUANT
        .captures(label)
        .or_else(|| FLOAT_QUANT.captures(label))
        .and_then(|caps| caps[2].parse().ok())
}

/// The quantization token inside a file name, upper-cased ("Q4_K_M")
pub fn quantization_label(file_name: &str) -> Option<String> {
    INT_QUANT
        .captures(file_name)
        .or_else(|| FLOAT_QUANT.captures(file_name))
        .map(|caps| caps[1].to_uppercase())
}

/// RAM multiplier for a quantization label, monotonic in precision
pub fn ram_multiplier(label: &str) -> f64 {
    match quantization_bits(label) {
        Some(bits) if bits <= 4 => 1.5,
        Some(5) => 1.7,
        Some(6) | Some(7) => 1.8,
        Some(8) => 2.0,
        Some(16) => 2.5,
        Some(32) => 3.0,
        _ => UNKNOWN_QUANT_MULTIPLIER,
    }
}

/// Estimated RAM (MB) needed to run a model file of the given size
pub fn estimate_required_ram_mb(file_size_bytes: u64, quantization: &str) -> u64 {
    let file_mb = file_size_bytes as f64 / BYTES_PER_MB;
    (file_mb * ram_multiplier(quantization)).ceil() as u64
}

/// How well a model fits the memory currently available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compatibility {
    Compatible,
    Marginal,
    Incompatible,
}

/// Ratio thresholds separating the compatibility tiers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityThresholds {
    /// required/available at or below this is compatible
    pub compatible_ratio: f64,
    /// required/available at or below this is marginal
    pub marginal_ratio: f64,
}

impl Default for CompatibilityThresholds {
    fn default() -> Self {
        Self {
            compatible_ratio: 0.6,
            marginal_ratio: 0.85,
        }
    }
}

impl CompatibilityThresholds {
    pub fn check(&self, required_mb: u64, available_mb: u64) -> Compatibility {
        if available_mb == 0 {
            return if required_mb == 0 {
                Compatibility::Compatible
            } else {
                Compatibility::Incompatible
            };
        }

        let ratio = required_mb as f64 / available_mb as f64;
        if ratio <= self.compatible_ratio {
            Compatibility::Compatible
        } else if ratio <= self.marginal_ratio {
            Compatibility::Marginal
        } else {
            Compatibility::Incompatible
        }
    }
}

/// Compatibility tier using the default thresholds
pub fn check_compatibility(required_mb: u64, available_mb: u64) -> Compatibility {
    CompatibilityThresholds::default().check(required_mb, available_mb)
}
