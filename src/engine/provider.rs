//! Generation engine capability
//!
//! The inference runtime is consumed through `GenerationEngine`; backends are
//! swappable implementations of the same contract. Only the lifecycle
//! controller holds an engine handle.

use std::path::Path;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::GenerationConfig;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Failed to unload model: {0}")]
    UnloadFailed(String),

    /// Backend process or library not reachable
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid engine handle: {0}")]
    InvalidHandle(u64),

    #[error("Engine protocol error: {0}")]
    Protocol(String),
}

/// Opaque reference to a model resident in the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineHandle(pub u64);

/// Load-time parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadParams {
    pub context_length: u32,
    pub batch_size: u32,
}

impl LoadParams {
    pub const DEFAULT_BATCH_SIZE: u32 = 512;

    pub fn new(context_length: u32) -> Self {
        Self {
            context_length,
            batch_size: Self::DEFAULT_BATCH_SIZE.min(context_length.max(1)),
        }
    }
}

/// One generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub config: GenerationConfig,
}

/// Lazy token sequence; ends after the last token or the first error
pub type TokenStream = BoxStream<'static, Result<String, EngineError>>;

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    async fn load(&self, path: &Path, params: LoadParams) -> Result<EngineHandle, EngineError>;

    async fn generate(
        &self,
        handle: EngineHandle,
        request: GenerationRequest,
    ) -> Result<TokenStream, EngineError>;

    /// Ask the backend to end the running generation early
    async fn stop(&self, handle: EngineHandle) -> Result<(), EngineError>;

    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError>;

    async fn memory_footprint_mb(&self, handle: EngineHandle) -> Result<u64, EngineError>;

    /// Release backend resources (processes, contexts)
    async fn shutdown(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
