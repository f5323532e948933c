//! Model catalog
//!
//! Merges the curated table, the on-disk scan of the models directory and
//! remote search results into one queryable view. The in-memory map is only
//! mutated here and by the download coordinator when a transfer completes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::RwLock;

use super::remote::RemoteCatalog;
use super::types::{
    ModelDescriptor, Provenance, RecommendationTiers, RemoteFile, RemoteModel, RemoteSource,
};
use crate::error::{LifecycleError, Result};

/// Suffix of in-progress download files
pub const PARTIAL_SUFFIX: &str = "part";

pub struct ModelCatalog {
    models_dir: PathBuf,
    bundled_dir: Option<PathBuf>,
    models: RwLock<HashMap<String, ModelDescriptor>>,
    remote: Arc<dyn RemoteCatalog>,
    tiers: RecommendationTiers,
}

impl ModelCatalog {
    pub fn new(
        models_dir: PathBuf,
        bundled_dir: Option<PathBuf>,
        known: Vec<ModelDescriptor>,
        remote: Arc<dyn RemoteCatalog>,
    ) -> Self {
        let models = known.into_iter().map(|m| (m.id.clone(), m)).collect();
        Self {
            models_dir,
            bundled_dir,
            models: RwLock::new(models),
            remote,
            tiers: RecommendationTiers::default(),
        }
    }

    pub fn with_tiers(mut self, tiers: RecommendationTiers) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Where a descriptor's file lives (or will live) on disk
    pub fn local_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        match (descriptor.provenance, &self.bundled_dir) {
            (Provenance::Bundled, Some(dir)) => dir.join(&descriptor.file_name),
            _ => self.models_dir.join(&descriptor.file_name),
        }
    }

    /// Temp path a transfer writes to before the final rename
    pub fn partial_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir
            .join(format!("{}.{}", descriptor.file_name, PARTIAL_SUFFIX))
    }

    /// Scan the models directory and reconcile provenance with what is on disk
    ///
    /// Returns the number of ready models.
    pub async fn initialize(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.models_dir).await?;
        self.remove_partial_files().await;

        let mut models = self.models.write().await;
        for descriptor in models.values_mut() {
            let path = self.local_path(descriptor);

            if descriptor.provenance == Provenance::Bundled {
                if tokio::fs::metadata(&path).await.is_err() {
                    warn!("Bundled model {} missing at {}", descriptor.id, path.display());
                }
                continue;
            }

            let updated = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => descriptor.with_provenance(Provenance::Downloaded, meta.len()),
                _ => descriptor.with_provenance(Provenance::RemoteOnly, descriptor.size_bytes),
            };
            *descriptor = updated;
        }

        let ready = models.values().filter(|m| m.is_ready()).count();
        info!(
            "Model catalog initialized: {} known, {} ready in {}",
            models.len(),
            ready,
            self.models_dir.display()
        );
        Ok(ready)
    }

    /// Transfers always restart from zero, so leftovers are garbage
    async fn remove_partial_files(&self) {
        let mut entries = match tokio::fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to scan models directory: {}", e);
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e == PARTIAL_SUFFIX).unwrap_or(false) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!("Removed stale partial download {}", path.display()),
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }
    }

    /// All known models, smallest first
    pub async fn list_all(&self) -> Vec<ModelDescriptor> {
        let models = self.models.read().await;
        let mut all: Vec<ModelDescriptor> = models.values().cloned().collect();
        all.sort_by(|a, b| a.size_bytes.cmp(&b.size_bytes).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Bundled and downloaded models, smallest first
    pub async fn list_ready(&self) -> Vec<ModelDescriptor> {
        self.list_all()
            .await
            .into_iter()
            .filter(|m| m.is_ready())
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.models.read().await.get(id).cloned()
    }

    pub async fn require(&self, id: &str) -> Result<ModelDescriptor> {
        self.get(id)
            .await
            .ok_or_else(|| LifecycleError::ModelNotFound(id.to_string()))
    }

    /// Path of a ready model whose file exists; None otherwise
    pub async fn model_path(&self, id: &str) -> Option<PathBuf> {
        let descriptor = self.get(id).await?;
        if !descriptor.is_ready() {
            return None;
        }
        let path = self.local_path(&descriptor);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }

    /// Fetch URL of a remote file
    pub fn download_url(&self, source: &RemoteSource) -> String {
        self.remote.download_url(&source.repo_id, &source.file_name)
    }

    /// Search the remote catalog
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<RemoteModel>> {
        self.remote.search(query, limit).await
    }

    /// Register one file of a search result, converging on a stable id
    pub async fn register_from_remote(&self, model: &RemoteModel, file: &RemoteFile) -> ModelDescriptor {
        let size_bytes = match file.size_bytes {
            Some(size) => size,
            None => self.lookup_size(&model.repo_id, &file.file_name).await,
        };

        let candidate = ModelDescriptor::remote(
            model.repo_id.clone(),
            file.file_name.clone(),
            format!("{} ({})", model.display_name, file.file_name),
            size_bytes,
        );
        // Check the disk before taking the write lock
        let on_disk = match tokio::fs::metadata(self.local_path(&candidate)).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        };

        let mut models = self.models.write().await;
        if let Some(existing) = models.get(&candidate.id) {
            if existing.size_bytes == 0 && size_bytes > 0 {
                let refreshed = existing.with_provenance(existing.provenance, size_bytes);
                models.insert(refreshed.id.clone(), refreshed.clone());
                return refreshed;
            }
            return existing.clone();
        }

        let descriptor = match on_disk {
            Some(len) => candidate.with_provenance(Provenance::Downloaded, len),
            None => candidate,
        };
        debug!("Registered remote model {} as {}", file.file_name, descriptor.id);
        models.insert(descriptor.id.clone(), descriptor.clone());
        descriptor
    }

    async fn lookup_size(&self, repo_id: &str, file_name: &str) -> u64 {
        match self.remote.file_metadata(repo_id).await {
            Ok(files) => files
                .into_iter()
                .find(|f| f.file_name == file_name)
                .and_then(|f| f.size_bytes)
                .unwrap_or(0),
            Err(e) => {
                warn!("Could not fetch file sizes for {}: {}", repo_id, e);
                0
            }
        }
    }

    /// Called by the download coordinator when a file lands on disk
    pub(crate) async fn mark_downloaded(&self, id: &str, size_bytes: u64) -> Result<ModelDescriptor> {
        let mut models = self.models.write().await;
        let current = models
            .get(id)
            .ok_or_else(|| LifecycleError::ModelNotFound(id.to_string()))?;
        let updated = current.with_provenance(Provenance::Downloaded, size_bytes);
        models.insert(id.to_string(), updated.clone());
        info!("Model {} downloaded ({} bytes)", id, size_bytes);
        Ok(updated)
    }

    /// Delete a downloaded file and revert the model to remote-only
    pub async fn remove_download(&self, id: &str) -> Result<ModelDescriptor> {
        let descriptor = self.require(id).await?;
        if descriptor.provenance == Provenance::Bundled {
            return Err(LifecycleError::NotRemovable(format!(
                "{} is bundled with the app",
                id
            )));
        }

        let path = self.local_path(&descriptor);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Deleted model file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let reverted = descriptor.with_provenance(Provenance::RemoteOnly, descriptor.size_bytes);
        self.models
            .write()
            .await
            .insert(id.to_string(), reverted.clone());
        Ok(reverted)
    }

    /// Default model for a device with `device_ram_mb` of RAM
    ///
    /// High-RAM devices get the largest ready model, medium devices the
    /// largest one needing at most half their RAM, everything else the
    /// smallest ready model.
    pub async fn recommended_id(&self, device_ram_mb: u64) -> Result<String> {
        let ready = self.list_ready().await;
        let smallest = ready.first().ok_or(LifecycleError::NoModelAvailable)?;

        let choice = if device_ram_mb >= self.tiers.high_ram_mb {
            ready.last().unwrap_or(smallest)
        } else if device_ram_mb >= self.tiers.medium_ram_mb {
            ready
                .iter()
                .rev()
                .find(|m| m.required_ram_mb <= device_ram_mb / 2)
                .unwrap_or(smallest)
        } else {
            smallest
        };

        debug!("Recommended model for {} MB RAM: {}", device_ram_mb, choice.id);
        Ok(choice.id.clone())
    }
}
