//! Device telemetry
//!
//! Module structure:
//! - types.rs: DeviceStatus, BatteryState, raw readings and thresholds
//! - source.rs: TelemetrySource trait and the sysinfo-backed implementation
//! - monitor.rs: DeviceTelemetryMonitor polling loop and broadcast

pub mod types;
pub mod source;
pub mod monitor;

pub use types::{BatteryReading, BatteryState, DeviceStatus, DeviceThresholds, MemoryReading};
pub use source::{estimate_total_ram_mb, SystemTelemetrySource, TelemetrySource};
pub use monitor::DeviceTelemetryMonitor;
