//! Optimization policy
//!
//! Module structure:
//! - types.rs: OptimizationMode, OptimizationConfig, GenerationConfig, PolicyEvent
//! - profiles.rs: per-mode generation profiles and threshold predicates
//! - engine.rs: OptimizationPolicyEngine (edge-triggered evaluation)

pub mod types;
pub mod profiles;
pub mod engine;

pub use types::{GenerationConfig, OptimizationConfig, OptimizationMode, PolicyEvent, PolicyThresholds};
pub use profiles::recommended_config;
pub use engine::OptimizationPolicyEngine;
