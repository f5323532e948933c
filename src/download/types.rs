//! Download types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::catalog::derive_model_id;

/// Identity of a transfer: one remote file of one repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadKey {
    pub source_id: String,
    pub file_name: String,
}

impl DownloadKey {
    pub fn new(source_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            file_name: file_name.into(),
        }
    }

    /// Progress key; identical to the id of the descriptor being fetched
    pub fn task_id(&self) -> String {
        derive_model_id(&self.source_id, &self.file_name)
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.file_name)
    }
}

/// Download status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadStatus::Downloading)
    }
}

/// Progress event, broadcast for every chunk and once per terminal outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub task_id: String,
    pub key: DownloadKey,
    pub received_bytes: u64,
    /// None until the transport reports a length
    pub total_bytes: Option<u64>,
    /// Always within [0.0, 1.0]
    pub fraction: f32,
    pub status: DownloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadProgress {
    pub fn new(key: &DownloadKey, received_bytes: u64, total_bytes: Option<u64>, status: DownloadStatus) -> Self {
        let fraction = match (status, total_bytes) {
            (DownloadStatus::Completed, _) => 1.0,
            (_, Some(total)) if total > 0 => (received_bytes as f64 / total as f64).clamp(0.0, 1.0) as f32,
            _ => 0.0,
        };

        Self {
            task_id: key.task_id(),
            key: key.clone(),
            received_bytes,
            total_bytes,
            fraction,
            status,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Live entry of an in-flight transfer
#[derive(Debug)]
pub struct DownloadTask {
    pub model_id: String,
    pub total_bytes: Option<u64>,
    pub received_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub cancel_token: CancellationToken,
}

impl DownloadTask {
    pub fn new(model_id: impl Into<String>, total_bytes: Option<u64>, cancel_token: CancellationToken) -> Self {
        Self {
            model_id: model_id.into(),
            total_bytes,
            received_bytes: 0,
            started_at: Utc::now(),
            cancel_token,
        }
    }

    pub fn snapshot(&self, key: &DownloadKey) -> DownloadSnapshot {
        DownloadSnapshot {
            key: key.clone(),
            model_id: self.model_id.clone(),
            total_bytes: self.total_bytes,
            received_bytes: self.received_bytes,
            started_at: self.started_at,
        }
    }
}

/// Read-only copy of a `DownloadTask`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub key: DownloadKey,
    pub model_id: String,
    pub total_bytes: Option<u64>,
    pub received_bytes: u64,
    pub started_at: DateTime<Utc>,
}
