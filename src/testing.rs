//! Scripted collaborators for unit tests

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::catalog::{ModelCatalog, ModelDescriptor, Provenance, RemoteCatalog, RemoteFile, RemoteModel};
use crate::download::{TransferBody, Transport};
use crate::engine::{EngineError, EngineHandle, GenerationEngine, GenerationRequest, LoadParams, TokenStream};
use crate::error::{LifecycleError, Result};
use crate::telemetry::{BatteryReading, BatteryState, MemoryReading, TelemetrySource};

// ============================================================================
// Engine
// ============================================================================

/// In-memory engine that records every resident handle
pub struct MockEngine {
    next_handle: AtomicU64,
    resident: Mutex<HashSet<u64>>,
    max_resident: AtomicUsize,
    loads: Mutex<Vec<LoadParams>>,
    stops: AtomicUsize,
    fail_load: AtomicBool,
    fail_unload: AtomicBool,
    load_delay: Duration,
    tokens: Vec<String>,
    token_delay: Duration,
    fail_generation_after: Option<usize>,
}

impl MockEngine {
    pub const FOOTPRINT_MB: u64 = 512;

    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(0),
            resident: Mutex::new(HashSet::new()),
            max_resident: AtomicUsize::new(0),
            loads: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            fail_load: AtomicBool::new(false),
            fail_unload: AtomicBool::new(false),
            load_delay: Duration::ZERO,
            tokens: Vec::new(),
            token_delay: Duration::ZERO,
            fail_generation_after: None,
        }
    }

    pub fn with_tokens(mut self, tokens: &[&str]) -> Self {
        self.tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Emit `count` tokens, then fail the stream
    pub fn failing_generation_after(mut self, count: usize) -> Self {
        self.fail_generation_after = Some(count);
        self
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unload(&self, fail: bool) {
        self.fail_unload.store(fail, Ordering::SeqCst);
    }

    pub fn resident_count(&self) -> usize {
        self.resident.lock().unwrap().len()
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> Vec<LoadParams> {
        self.loads.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn check_resident(&self, handle: EngineHandle) -> std::result::Result<(), EngineError> {
        if self.resident.lock().unwrap().contains(&handle.0) {
            Ok(())
        } else {
            Err(EngineError::InvalidHandle(handle.0))
        }
    }
}

#[async_trait]
impl GenerationEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn load(&self, _path: &Path, params: LoadParams) -> std::result::Result<EngineHandle, EngineError> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.loads.lock().unwrap().push(params);
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(EngineError::LoadFailed("scripted load failure".to_string()));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let mut resident = self.resident.lock().unwrap();
        resident.insert(handle);
        self.max_resident.fetch_max(resident.len(), Ordering::SeqCst);
        Ok(EngineHandle(handle))
    }

    async fn generate(
        &self,
        handle: EngineHandle,
        request: GenerationRequest,
    ) -> std::result::Result<TokenStream, EngineError> {
        self.check_resident(handle)?;

        let limit = request.config.max_tokens as usize;
        let delay = self.token_delay;
        let mut items: Vec<std::result::Result<String, EngineError>> =
            self.tokens.iter().take(limit).cloned().map(Ok).collect();
        if let Some(count) = self.fail_generation_after {
            items.truncate(count);
            items.push(Err(EngineError::GenerationFailed("scripted failure".to_string())));
        }

        Ok(futures_util::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }

    async fn stop(&self, _handle: EngineHandle) -> std::result::Result<(), EngineError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self, handle: EngineHandle) -> std::result::Result<(), EngineError> {
        if self.fail_unload.load(Ordering::SeqCst) {
            return Err(EngineError::UnloadFailed("scripted unload failure".to_string()));
        }
        if self.resident.lock().unwrap().remove(&handle.0) {
            Ok(())
        } else {
            Err(EngineError::InvalidHandle(handle.0))
        }
    }

    async fn memory_footprint_mb(&self, handle: EngineHandle) -> std::result::Result<u64, EngineError> {
        self.check_resident(handle)?;
        Ok(Self::FOOTPRINT_MB)
    }
}

// ============================================================================
// Remote catalog and transport
// ============================================================================

#[derive(Default)]
pub struct MockRemote {
    models: Vec<RemoteModel>,
    files: HashMap<String, Vec<RemoteFile>>,
}

impl MockRemote {
    pub fn with_model(mut self, model: RemoteModel) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_file(mut self, repo_id: &str, file_name: &str, size_bytes: u64) -> Self {
        self.files
            .entry(repo_id.to_string())
            .or_default()
            .push(RemoteFile {
                file_name: file_name.to_string(),
                size_bytes: Some(size_bytes),
            });
        self
    }
}

#[async_trait]
impl RemoteCatalog for MockRemote {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RemoteModel>> {
        let query = query.to_lowercase();
        Ok(self
            .models
            .iter()
            .filter(|m| m.repo_id.to_lowercase().contains(&query))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn file_metadata(&self, repo_id: &str) -> Result<Vec<RemoteFile>> {
        Ok(self.files.get(repo_id).cloned().unwrap_or_default())
    }

    fn download_url(&self, repo_id: &str, file_name: &str) -> String {
        format!("mock://{}/{}", repo_id, file_name)
    }
}

/// Serves `chunks` chunks of `chunk_size` bytes for any URL
pub struct MockTransport {
    chunks: usize,
    chunk_size: usize,
    delay: Duration,
    fail_after: Option<usize>,
    fetches: AtomicUsize,
}

impl MockTransport {
    pub fn new(chunks: usize, chunk_size: usize) -> Self {
        Self {
            chunks,
            chunk_size,
            delay: Duration::ZERO,
            fail_after: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the stream after `count` chunks
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, url: &str) -> Result<TransferBody> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let chunk = Bytes::from(vec![0u8; self.chunk_size]);
        let fail_after = self.fail_after;
        let delay = self.delay;
        let url = url.to_string();

        let stream = futures_util::stream::iter(0..self.chunks)
            .then(move |index| {
                let chunk = chunk.clone();
                let url = url.clone();
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    match fail_after {
                        Some(limit) if index >= limit => Err(LifecycleError::DownloadFailed(format!(
                            "connection reset while fetching {}",
                            url
                        ))),
                        _ => Ok(chunk),
                    }
                }
            })
            .boxed();

        Ok(TransferBody {
            total_bytes: Some((self.chunks * self.chunk_size) as u64),
            stream,
        })
    }
}

// ============================================================================
// Telemetry
// ============================================================================

/// Telemetry source whose readings tests change at will
pub struct ScriptedTelemetry {
    memory: Mutex<MemoryReading>,
    battery: Mutex<BatteryReading>,
    failing: AtomicBool,
}

impl ScriptedTelemetry {
    pub fn new(available_mb: u64, battery_percent: u8) -> Self {
        Self {
            memory: Mutex::new(MemoryReading {
                total_mb: 8192,
                available_mb,
            }),
            battery: Mutex::new(BatteryReading {
                percent: battery_percent,
                state: BatteryState::Discharging,
            }),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_battery(&self, percent: u8, state: BatteryState) {
        *self.battery.lock().unwrap() = BatteryReading { percent, state };
    }

    pub fn set_available(&self, available_mb: u64) {
        self.memory.lock().unwrap().available_mb = available_mb;
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(LifecycleError::DeviceQueryFailed("scripted failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetry {
    async fn memory(&self) -> Result<MemoryReading> {
        self.check()?;
        Ok(*self.memory.lock().unwrap())
    }

    async fn battery(&self) -> Result<BatteryReading> {
        self.check()?;
        Ok(*self.battery.lock().unwrap())
    }
}

// ============================================================================
// Catalog fixtures
// ============================================================================

/// Catalog with bundled models `ids` on disk plus a not-downloaded "remote-only"
pub async fn ready_catalog(dir: &Path, ids: &[&str]) -> Arc<ModelCatalog> {
    let bundled_dir = dir.join("bundled");
    std::fs::create_dir_all(&bundled_dir).unwrap();

    let mut known = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let file_name = format!("{}-Q4_K_M.gguf", id);
        std::fs::write(bundled_dir.join(&file_name), b"weights").unwrap();
        known.push(ModelDescriptor::bundled(*id, *id, file_name, (i as u64 + 1) * 1024 * 1024));
    }

    let mut remote_only = ModelDescriptor::bundled("remote-only", "Remote", "remote-only-Q4_K_M.gguf", 1024);
    remote_only.provenance = Provenance::RemoteOnly;
    known.push(remote_only);

    let catalog = ModelCatalog::new(
        dir.join("models"),
        Some(bundled_dir),
        known,
        Arc::new(MockRemote::default()),
    );
    catalog.initialize().await.unwrap();
    Arc::new(catalog)
}
