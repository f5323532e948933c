//! Manager configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{RecommendationTiers, DEFAULT_REMOTE_BASE_URL};
use crate::error::Result;
use crate::estimator::CompatibilityThresholds;
use crate::policy::OptimizationConfig;
use crate::telemetry::DeviceThresholds;

const APP_DIR_NAME: &str = "model-lifecycle";

/// Telemetry polling configuration
///
/// The low-memory and low-battery flags on each snapshot come from the
/// optimization thresholds, so telemetry and policy always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub poll_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Top-level configuration; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Downloaded model files
    pub models_dir: PathBuf,
    /// Models shipped with the app; defaults to `models_dir`
    pub bundled_dir: Option<PathBuf>,
    /// Key-value settings document
    pub settings_path: PathBuf,
    /// Generation sidecar binary; searched next to the executable when unset
    pub sidecar_path: Option<PathBuf>,
    pub telemetry: TelemetryConfig,
    pub optimization: OptimizationConfig,
    pub compatibility: CompatibilityThresholds,
    pub recommendation: RecommendationTiers,
    pub remote_base_url: String,
    /// Unload the resident model when the policy reports low memory
    pub unload_on_low_memory: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME);
        Self::with_base_dir(base)
    }
}

impl ManagerConfig {
    /// Defaults rooted at `base` instead of the platform data directory
    pub fn with_base_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            models_dir: base.join("models"),
            bundled_dir: None,
            settings_path: base.join("settings.json"),
            sidecar_path: None,
            telemetry: TelemetryConfig::default(),
            optimization: OptimizationConfig::default(),
            compatibility: CompatibilityThresholds::default(),
            recommendation: RecommendationTiers::default(),
            remote_base_url: DEFAULT_REMOTE_BASE_URL.to_string(),
            unload_on_low_memory: false,
        }
    }

    /// Snapshot flag thresholds, taken from the policy's thresholds
    pub fn device_thresholds(&self) -> DeviceThresholds {
        self.optimization.thresholds.device_thresholds()
    }

    /// Read a JSON config; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_json::from_str(&content)?;
                log::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use crate::policy::OptimizationMode;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::with_base_dir("/tmp/ml");
        assert_eq!(config.models_dir, PathBuf::from("/tmp/ml/models"));
        assert_eq!(config.settings_path, PathBuf::from("/tmp/ml/settings.json"));
        assert_eq!(config.telemetry.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.optimization.mode, OptimizationMode::Balanced);
        assert_eq!(config.optimization.thresholds.critical_battery_percent, 10);
        assert_eq!(config.compatibility.compatible_ratio, 0.6);
        assert_eq!(config.compatibility.marginal_ratio, 0.85);
        assert_eq!(config.recommendation.high_ram_mb, 8192);
        assert_eq!(config.remote_base_url, "https://huggingface.co");
        assert!(!config.unload_on_low_memory);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = ManagerConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.telemetry.poll_interval_secs, 30);
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "models_dir": "/data/models",
                "telemetry": { "poll_interval_secs": 5 },
                "optimization": {
                    "mode": "battery_saver",
                    "critical_battery_percent": 15,
                    "low_battery_percent": 25
                },
                "unload_on_low_memory": true
            }"#,
        )
        .unwrap();

        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.models_dir, PathBuf::from("/data/models"));
        assert_eq!(config.telemetry.poll_interval_secs, 5);
        assert_eq!(config.optimization.mode, OptimizationMode::BatterySaver);
        assert_eq!(config.optimization.thresholds.critical_battery_percent, 15);
        assert_eq!(config.optimization.thresholds.low_battery_percent, 25);
        assert_eq!(config.optimization.thresholds.low_memory_mb, 1024);

        let device = config.device_thresholds();
        assert_eq!(device.low_battery_percent, 25);
        assert_eq!(device.low_memory_mb, 1024);
        assert!(config.unload_on_low_memory);
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(ManagerConfig::load(&path), Err(LifecycleError::Json(_))));
    }
}
