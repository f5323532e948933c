//! Generation engine
//!
//! Module structure:
//! - provider.rs: GenerationEngine trait, handles, load/generation parameters
//! - sidecar.rs: out-of-process JSON-RPC backend

pub mod provider;
pub mod sidecar;

pub use provider::{
    EngineError, EngineHandle, GenerationEngine, GenerationRequest, LoadParams, TokenStream,
};
pub use sidecar::{SidecarConfig, SidecarEngine};
