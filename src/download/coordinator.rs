//! Download coordinator
//!
//! One entry per in-flight transfer, keyed by (source id, file name). Distinct
//! keys download fully in parallel; a second start for an active key is
//! rejected. Every terminal outcome removes the entry before the terminal
//! progress event goes out, so a subscriber that sees `Completed`,
//! `Cancelled` or `Failed` can immediately restart the same key.

use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::transport::Transport;
use super::types::{DownloadKey, DownloadProgress, DownloadSnapshot, DownloadStatus, DownloadTask};
use crate::catalog::{ModelCatalog, ModelDescriptor, Provenance, RemoteSource};
use crate::error::{LifecycleError, Result};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

type TaskMap = Arc<DashMap<DownloadKey, DownloadTask>>;

/// Caller's side of a started download
pub struct DownloadHandle {
    key: DownloadKey,
    cancel_token: CancellationToken,
    join: JoinHandle<Result<ModelDescriptor>>,
}

impl DownloadHandle {
    pub fn key(&self) -> &DownloadKey {
        &self.key
    }

    pub fn task_id(&self) -> String {
        self.key.task_id()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Wait for the terminal outcome; the entry is already gone when this returns
    pub async fn wait(self) -> Result<ModelDescriptor> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => Err(LifecycleError::DownloadFailed(format!(
                "Download task for {} aborted: {}",
                self.key, e
            ))),
        }
    }
}

/// Removes the task entry when the worker finishes, even on panic
struct EntryGuard {
    tasks: TaskMap,
    key: DownloadKey,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.tasks.remove(&self.key);
    }
}

pub struct DownloadCoordinator {
    catalog: Arc<ModelCatalog>,
    transport: Arc<dyn Transport>,
    tasks: TaskMap,
    progress: broadcast::Sender<DownloadProgress>,
}

impl DownloadCoordinator {
    pub fn new(catalog: Arc<ModelCatalog>, transport: Arc<dyn Transport>) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            catalog,
            transport,
            tasks: Arc::new(DashMap::new()),
            progress,
        }
    }

    /// Start fetching a remote model
    pub fn start(&self, descriptor: &ModelDescriptor) -> Result<DownloadHandle> {
        if descriptor.provenance == Provenance::Bundled {
            return Err(LifecycleError::NotDownloadable(format!(
                "{} is bundled with the app",
                descriptor.id
            )));
        }
        let source = descriptor.remote.clone().ok_or_else(|| {
            LifecycleError::NotDownloadable(format!("{} has no remote source", descriptor.id))
        })?;
        let key = DownloadKey::new(source.repo_id.clone(), source.file_name.clone());

        let cancel_token = CancellationToken::new();
        let initial_total = (descriptor.size_bytes > 0).then_some(descriptor.size_bytes);

        // Check and insert under the shard lock
        match self.tasks.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(LifecycleError::DuplicateDownload(key.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(DownloadTask::new(
                    descriptor.id.clone(),
                    initial_total,
                    cancel_token.clone(),
                ));
            }
        }

        info!("Starting download of {} ({})", descriptor.id, key);

        let worker = TransferWorker {
            catalog: self.catalog.clone(),
            transport: self.transport.clone(),
            tasks: self.tasks.clone(),
            progress: self.progress.clone(),
            key: key.clone(),
            source,
            descriptor: descriptor.clone(),
            cancel_token: cancel_token.clone(),
        };
        let join = tokio::spawn(worker.run());

        Ok(DownloadHandle {
            key,
            cancel_token,
            join,
        })
    }

    /// Signal a transfer to abort; returns false when nothing was active
    ///
    /// Cleanup finishes asynchronously: the key stays active until the
    /// partial file is gone.
    pub fn cancel(&self, key: &DownloadKey) -> bool {
        match self.tasks.get(key) {
            Some(task) => {
                info!("Cancelling download {}", key);
                task.cancel_token.cancel();
                true
            }
            None => {
                debug!("Cancel for {} ignored, not active", key);
                false
            }
        }
    }

    pub fn cancel_all(&self) {
        for task in self.tasks.iter() {
            task.cancel_token.cancel();
        }
    }

    pub fn get(&self, key: &DownloadKey) -> Option<DownloadSnapshot> {
        self.tasks.get(key).map(|task| task.snapshot(key))
    }

    pub fn is_active(&self, key: &DownloadKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn active(&self) -> Vec<DownloadSnapshot> {
        self.tasks
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadProgress> {
        self.progress.subscribe()
    }
}

/// Owns one transfer from fetch to terminal event
struct TransferWorker {
    catalog: Arc<ModelCatalog>,
    transport: Arc<dyn Transport>,
    tasks: TaskMap,
    progress: broadcast::Sender<DownloadProgress>,
    key: DownloadKey,
    source: RemoteSource,
    descriptor: ModelDescriptor,
    cancel_token: CancellationToken,
}

impl TransferWorker {
    async fn run(self) -> Result<ModelDescriptor> {
        let guard = EntryGuard {
            tasks: self.tasks.clone(),
            key: self.key.clone(),
        };
        let partial = self.catalog.partial_path(&self.descriptor);

        let outcome = match self.transfer(&partial).await {
            Ok(received) => self.record_completion(received).await,
            Err(e) => Err(e),
        };

        let (received, total) = self
            .tasks
            .get(&self.key)
            .map(|t| (t.received_bytes, t.total_bytes))
            .unwrap_or((0, None));

        let event = match &outcome {
            Ok(descriptor) => {
                info!("Download of {} complete", descriptor.id);
                DownloadProgress::new(&self.key, received, total, DownloadStatus::Completed)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&partial).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial file {}: {}", partial.display(), rm);
                    }
                }
                let status = match e {
                    LifecycleError::DownloadCancelled(_) => {
                        info!("Download of {} cancelled", self.descriptor.id);
                        DownloadStatus::Cancelled
                    }
                    _ => {
                        warn!("Download of {} failed: {}", self.descriptor.id, e);
                        DownloadStatus::Failed
                    }
                };
                DownloadProgress::new(&self.key, received, total, status).with_error(e.to_string())
            }
        };

        drop(guard);
        let _ = self.progress.send(event);
        outcome
    }

    /// Mark the model downloaded; the renamed file goes if that fails
    async fn record_completion(&self, received: u64) -> Result<ModelDescriptor> {
        match self.catalog.mark_downloaded(&self.descriptor.id, received).await {
            Ok(descriptor) => Ok(descriptor),
            Err(e) => {
                let path = self.catalog.local_path(&self.descriptor);
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to remove unrecorded download {}: {}", path.display(), rm);
                }
                Err(e)
            }
        }
    }

    async fn transfer(&self, partial: &Path) -> Result<u64> {
        let cancelled = || LifecycleError::DownloadCancelled(self.key.to_string());
        let url = self.catalog.download_url(&self.source);
        debug!("Fetching {}", url);

        tokio::fs::create_dir_all(self.catalog.models_dir()).await?;

        let body = tokio::select! {
            _ = self.cancel_token.cancelled() => return Err(cancelled()),
            body = self.transport.fetch(&url) => body?,
        };

        let total = body.total_bytes.or_else(|| self.task_total());
        self.record(0, total);

        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = body.stream;
        let mut received: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Err(cancelled()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await?;
                    received += chunk.len() as u64;
                    self.record(received, total);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        file.flush().await?;
        drop(file);

        if let Some(expected) = body.total_bytes {
            if received != expected {
                return Err(LifecycleError::DownloadFailed(format!(
                    "Transfer of {} ended at {} of {} bytes",
                    self.key, received, expected
                )));
            }
        }

        let destination = self.catalog.local_path(&self.descriptor);
        tokio::fs::rename(partial, &destination).await?;
        Ok(received)
    }

    fn task_total(&self) -> Option<u64> {
        self.tasks.get(&self.key).and_then(|t| t.total_bytes)
    }

    fn record(&self, received: u64, total: Option<u64>) {
        if let Some(mut task) = self.tasks.get_mut(&self.key) {
            task.received_bytes = received;
            task.total_bytes = total;
        }
        crate::perf_trace!("{}: {} / {:?} bytes", self.key, received, total);
        let _ = self.progress.send(DownloadProgress::new(
            &self.key,
            received,
            total,
            DownloadStatus::Downloading,
        ));
    }
}
