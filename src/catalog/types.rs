//! Model catalog types

use serde::{Deserialize, Serialize};

use super::id::{derive_model_id, local_file_name};
use crate::download::DownloadKey;
use crate::estimator::{estimate_required_ram_mb, quantization_label};

/// Where a model's weights come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Shipped with the app, never removable
    Bundled,
    /// Fetched from the remote catalog and present on disk
    Downloaded,
    /// Known remotely, not on disk
    RemoteOnly,
}

/// Remote origin of a downloadable model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSource {
    /// Catalog repository id (e.g. "bartowski/Llama-3.2-1B-Instruct-GGUF")
    pub repo_id: String,
    /// File name inside the repository
    pub file_name: String,
}

/// Immutable identity and metrics of one model variant
///
/// State changes (download finished, file removed) produce a new value
/// rather than mutating an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    /// File name on local storage
    pub file_name: String,
    pub size_bytes: u64,
    /// Quantization label ("Q4_K_M", "F16" ...), empty when unknown
    pub quantization: String,
    pub required_ram_mb: u64,
    pub provenance: Provenance,
    pub remote: Option<RemoteSource>,
    pub description: Option<String>,
}

impl ModelDescriptor {
    /// A model shipped inside the app bundle
    pub fn bundled(
        id: impl Into<String>,
        name: impl Into<String>,
        file_name: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let file_name = file_name.into();
        let quantization = quantization_label(&file_name).unwrap_or_default();
        Self {
            id: id.into(),
            name: name.into(),
            required_ram_mb: estimate_required_ram_mb(size_bytes, &quantization),
            file_name,
            size_bytes,
            quantization,
            provenance: Provenance::Bundled,
            remote: None,
            description: None,
        }
    }

    /// A model available from the remote catalog; id derived from (repo, file)
    pub fn remote(
        repo_id: impl Into<String>,
        remote_file_name: impl Into<String>,
        name: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let repo_id = repo_id.into();
        let remote_file_name = remote_file_name.into();
        let id = derive_model_id(&repo_id, &remote_file_name);
        let quantization = quantization_label(&remote_file_name).unwrap_or_default();

        Self {
            file_name: local_file_name(&id, &remote_file_name),
            id,
            name: name.into(),
            size_bytes,
            required_ram_mb: estimate_required_ram_mb(size_bytes, &quantization),
            quantization,
            provenance: Provenance::RemoteOnly,
            remote: Some(RemoteSource {
                repo_id,
                file_name: remote_file_name,
            }),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Bundled or downloaded
    pub fn is_ready(&self) -> bool {
        matches!(self.provenance, Provenance::Bundled | Provenance::Downloaded)
    }

    /// Download key; None for bundled models
    pub fn download_key(&self) -> Option<DownloadKey> {
        if self.provenance == Provenance::Bundled {
            return None;
        }
        self.remote
            .as_ref()
            .map(|r| DownloadKey::new(r.repo_id.clone(), r.file_name.clone()))
    }

    /// Copy with a new provenance and on-disk size
    pub fn with_provenance(&self, provenance: Provenance, size_bytes: u64) -> Self {
        Self {
            provenance,
            size_bytes,
            required_ram_mb: estimate_required_ram_mb(size_bytes, &self.quantization),
            ..self.clone()
        }
    }
}

/// One file of a remote repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub file_name: String,
    pub size_bytes: Option<u64>,
}

/// Remote search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteModel {
    pub repo_id: String,
    pub display_name: String,
    pub downloads: u64,
    pub likes: u64,
    pub files: Vec<RemoteFile>,
}

/// Device RAM tiers used to pick a default model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationTiers {
    /// At or above this, prefer the largest ready model
    pub high_ram_mb: u64,
    /// At or above this, prefer a medium model
    pub medium_ram_mb: u64,
}

impl Default for RecommendationTiers {
    fn default() -> Self {
        Self {
            high_ram_mb: 8192,
            medium_ram_mb: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_descriptor_fields() {
        let d = ModelDescriptor::remote("org/repo", "Tiny-Q4_K_M.gguf", "Tiny", 1024 * 1024 * 100);
        assert_eq!(d.provenance, Provenance::RemoteOnly);
        assert_eq!(d.quantization, "Q4_K_M");
        assert_eq!(d.required_ram_mb, 150);
        assert!(d.file_name.ends_with(".gguf"));
        assert!(!d.is_ready());
        assert_eq!(d.download_key().unwrap().file_name, "Tiny-Q4_K_M.gguf");
    }

    #[test]
    fn test_bundled_has_no_download_key() {
        let d = ModelDescriptor::bundled("tiny", "Tiny", "tiny-q8_0.gguf", 1000);
        assert!(d.is_ready());
        assert!(d.download_key().is_none());
    }

    #[test]
    fn test_with_provenance_returns_new_value() {
        let d = ModelDescriptor::remote("org/repo", "a-Q8_0.gguf", "A", 0);
        let downloaded = d.with_provenance(Provenance::Downloaded, 1024 * 1024);
        assert_eq!(d.provenance, Provenance::RemoteOnly);
        assert_eq!(downloaded.provenance, Provenance::Downloaded);
        assert_eq!(downloaded.required_ram_mb, 2);
        assert_eq!(downloaded.id, d.id);
    }
}
