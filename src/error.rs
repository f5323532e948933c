//! Error types shared by every lifecycle component

use thiserror::Error;

use crate::engine::EngineError;
use crate::lifecycle::SlotState;

#[derive(Error, Debug)]
pub enum LifecycleError {
    /// No descriptor with this id is registered
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Descriptor exists but its file is not on disk (not yet downloaded)
    #[error("Model file missing: {0}")]
    ModelFileMissing(String),

    /// Requested operation is not valid from the current slot state
    #[error("Cannot {action} while the model slot is {from}")]
    InvalidTransition { from: SlotState, action: &'static str },

    /// Another operation is in flight on the same resource
    #[error("Busy: {0}")]
    Busy(String),

    /// Underlying generation engine failure
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Download already in progress: {0}")]
    DuplicateDownload(String),

    #[error("Model cannot be downloaded: {0}")]
    NotDownloadable(String),

    #[error("Model cannot be removed: {0}")]
    NotRemovable(String),

    #[error("No model available")]
    NoModelAvailable,

    #[error("Device query failed: {0}")]
    DeviceQueryFailed(String),

    /// `current_status()` was called before the first successful poll
    #[error("Device status not yet available")]
    StatusNotYetAvailable,

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Inference blocked: {0}")]
    InferenceBlocked(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Download cancelled: {0}")]
    DownloadCancelled(String),

    #[error("Remote catalog error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl serde::Serialize for LifecycleError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
