//! Model lifecycle controller
//!
//! Owns the single engine slot. Every mutating operation first claims the
//! slot under a short synchronous lock (moving it to `loading`, `generating`
//! or `unloading`), then does its async engine work without the lock on a
//! spawned task, then publishes the terminal state. A caller that gives up
//! waiting does not strand the claim. A second caller that arrives while the slot
//! is claimed is rejected instead of interleaving with the first.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::state::{SlotState, SlotStatus};
use super::stream::GenerationStream;
use crate::catalog::ModelCatalog;
use crate::engine::{EngineError, EngineHandle, GenerationEngine, GenerationRequest, LoadParams};
use crate::error::{LifecycleError, Result};
use crate::policy::{GenerationConfig, OptimizationPolicyEngine};

struct LoadedModel {
    id: String,
    handle: EngineHandle,
    context_length: u32,
}

struct ActiveGeneration {
    id: u64,
    token: CancellationToken,
}

struct Slot {
    state: SlotState,
    model: Option<LoadedModel>,
    config: GenerationConfig,
    generation: Option<ActiveGeneration>,
    last_error: Option<String>,
}

impl Slot {
    fn status(&self) -> SlotStatus {
        SlotStatus {
            state: self.state,
            model_id: self.model.as_ref().map(|m| m.id.clone()),
            context_length: self.model.as_ref().map(|m| m.context_length),
            last_error: self.last_error.clone(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn reject(&self, action: &'static str) -> LifecycleError {
        LifecycleError::InvalidTransition {
            from: self.state,
            action,
        }
    }
}

pub(super) enum GenerationOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// State shared between the controller and live generation streams
pub(super) struct Shared {
    slot: Mutex<Slot>,
    status: watch::Sender<SlotStatus>,
    pub(super) engine: Arc<dyn GenerationEngine>,
    next_generation: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Called with the lock held so watchers see transitions in order
    fn publish(&self, slot: &Slot) {
        self.status.send_replace(slot.status());
    }

    fn set_state(&self, slot: &mut Slot, state: SlotState) {
        debug!("Slot {} -> {}", slot.state, state);
        slot.state = state;
        if state != SlotState::Error {
            slot.last_error = None;
        }
        self.publish(slot);
    }

    fn set_error(&self, slot: &mut Slot, message: String) {
        warn!("Slot {} -> error: {}", slot.state, message);
        slot.state = SlotState::Error;
        slot.last_error = Some(message);
        self.publish(slot);
    }

    pub(super) fn finish_generation(&self, id: u64, outcome: GenerationOutcome) {
        let mut slot = self.lock();
        let ours = slot.generation.as_ref().map(|g| g.id == id).unwrap_or(false);
        if !ours {
            return;
        }
        slot.generation = None;

        match outcome {
            GenerationOutcome::Completed | GenerationOutcome::Stopped => {
                if slot.state == SlotState::Generating {
                    self.set_state(&mut slot, SlotState::Ready);
                }
            }
            GenerationOutcome::Failed(message) => self.set_error(&mut slot, message),
        }
    }
}

/// Marks the slot `error` if claimed work ends without publishing a result
struct Claim {
    shared: Arc<Shared>,
    released: bool,
}

impl Claim {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            released: false,
        }
    }

    fn release(mut self) {
        self.released = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut slot = self.shared.lock();
        if slot.state.is_busy() {
            slot.generation = None;
            self.shared
                .set_error(&mut slot, "slot operation ended unexpectedly".to_string());
        }
    }
}

/// Run claimed engine work on its own task
///
/// Dropping the caller's future does not abandon the work: the task still
/// publishes the terminal slot state.
async fn run_claimed<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result,
        Err(e) => Err(EngineError::Unavailable(format!("slot task failed: {}", e)).into()),
    }
}

/// Engine work performed after the slot has been claimed
struct SlotWork {
    shared: Arc<Shared>,
    catalog: Arc<ModelCatalog>,
}

impl SlotWork {
    async fn resolve(&self, id: &str) -> Result<PathBuf> {
        let descriptor = self.catalog.require(id).await?;
        self.catalog.model_path(&descriptor.id).await.ok_or_else(|| {
            LifecycleError::ModelFileMissing(format!("{} is not downloaded", descriptor.id))
        })
    }

    fn fail(&self, claim: Claim, message: String) {
        let mut slot = self.shared.lock();
        self.shared.set_error(&mut slot, message);
        claim.release();
    }

    fn install(&self, claim: Claim, id: String, handle: EngineHandle, context_length: u32) {
        let mut slot = self.shared.lock();
        slot.model = Some(LoadedModel {
            id,
            handle,
            context_length,
        });
        self.shared.set_state(&mut slot, SlotState::Ready);
        claim.release();
    }

    async fn load(
        self,
        claim: Claim,
        id: String,
        previous_state: SlotState,
        previous_error: Option<String>,
        context_length: u32,
    ) -> Result<()> {
        let path = match self.resolve(&id).await {
            Ok(path) => path,
            Err(e) => {
                // Nothing touched the engine yet
                let mut slot = self.shared.lock();
                slot.state = previous_state;
                slot.last_error = previous_error;
                self.shared.publish(&slot);
                claim.release();
                return Err(e);
            }
        };

        let resident = {
            let slot = self.shared.lock();
            slot.model.as_ref().map(|m| (m.id.clone(), m.handle))
        };
        if let Some((previous_id, handle)) = resident {
            info!("Unloading {} before loading a new model", previous_id);
            if let Err(e) = self.shared.engine.unload(handle).await {
                self.fail(claim, e.to_string());
                return Err(e.into());
            }
            let mut slot = self.shared.lock();
            slot.model = None;
            self.shared.publish(&slot);
        }

        info!("Loading model {} (context {})", id, context_length);
        match self
            .shared
            .engine
            .load(&path, LoadParams::new(context_length))
            .await
        {
            Ok(handle) => {
                info!("Model {} ready", id);
                self.install(claim, id, handle, context_length);
                Ok(())
            }
            Err(e) => {
                self.fail(claim, e.to_string());
                Err(e.into())
            }
        }
    }

    async fn unload(self, claim: Claim, model_id: String, handle: EngineHandle) -> Result<()> {
        info!("Unloading model {}", model_id);
        match self.shared.engine.unload(handle).await {
            Ok(()) => {
                let mut slot = self.shared.lock();
                slot.model = None;
                self.shared.set_state(&mut slot, SlotState::Empty);
                claim.release();
                Ok(())
            }
            Err(e) => {
                // Handle kept so the caller can retry
                self.fail(claim, e.to_string());
                Err(e.into())
            }
        }
    }

    async fn reload(
        self,
        claim: Claim,
        model_id: String,
        handle: EngineHandle,
        context_length: u32,
    ) -> Result<()> {
        let path = match self.resolve(&model_id).await {
            Ok(path) => path,
            Err(e) => {
                self.fail(claim, e.to_string());
                return Err(e);
            }
        };

        if let Err(e) = self.shared.engine.unload(handle).await {
            self.fail(claim, e.to_string());
            return Err(e.into());
        }
        {
            let mut slot = self.shared.lock();
            slot.model = None;
            self.shared.publish(&slot);
        }

        match self
            .shared
            .engine
            .load(&path, LoadParams::new(context_length))
            .await
        {
            Ok(handle) => {
                self.install(claim, model_id, handle, context_length);
                Ok(())
            }
            Err(e) => {
                self.fail(claim, e.to_string());
                Err(e.into())
            }
        }
    }

    async fn start_generation(
        self,
        claim: Claim,
        id: u64,
        handle: EngineHandle,
        token: CancellationToken,
        request: GenerationRequest,
    ) -> Result<GenerationStream> {
        let result = self.shared.engine.generate(handle, request).await;
        // The stream's guard owns the slot from here on
        claim.release();
        match result {
            Ok(inner) => Ok(GenerationStream::new(self.shared, id, handle, token, inner)),
            Err(e) => {
                self.shared
                    .finish_generation(id, GenerationOutcome::Failed(e.to_string()));
                Err(e.into())
            }
        }
    }
}

pub struct ModelLifecycleController {
    shared: Arc<Shared>,
    catalog: Arc<ModelCatalog>,
    policy: Arc<OptimizationPolicyEngine>,
}

impl ModelLifecycleController {
    pub fn new(
        engine: Arc<dyn GenerationEngine>,
        catalog: Arc<ModelCatalog>,
        policy: Arc<OptimizationPolicyEngine>,
    ) -> Self {
        let (status, _) = watch::channel(SlotStatus::empty());
        let slot = Slot {
            state: SlotState::Empty,
            model: None,
            config: policy.current_config(),
            generation: None,
            last_error: None,
        };

        info!("Lifecycle controller using {} engine", engine.name());
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(slot),
                status,
                engine,
                next_generation: AtomicU64::new(0),
            }),
            catalog,
            policy,
        }
    }

    pub fn status(&self) -> SlotStatus {
        self.shared.lock().status()
    }

    pub fn state(&self) -> SlotState {
        self.shared.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotStatus> {
        self.shared.status.subscribe()
    }

    pub fn loaded_model_id(&self) -> Option<String> {
        self.shared.lock().model.as_ref().map(|m| m.id.clone())
    }

    /// Generation config currently applied
    pub fn config(&self) -> GenerationConfig {
        self.shared.lock().config.clone()
    }

    fn work(&self) -> SlotWork {
        SlotWork {
            shared: self.shared.clone(),
            catalog: self.catalog.clone(),
        }
    }

    /// Load `id` into the slot, unloading whatever was resident
    pub async fn load_model(&self, id: &str) -> Result<()> {
        let (previous_state, previous_error, context_length) = {
            let mut slot = self.shared.lock();
            if slot.state.is_busy() {
                return Err(slot.reject("load a model"));
            }
            if slot.state == SlotState::Ready
                && slot
                    .model
                    .as_ref()
                    .map(|m| m.id == id && m.context_length == slot.config.context_length)
                    .unwrap_or(false)
            {
                debug!("Model {} already loaded", id);
                return Ok(());
            }
            let previous = (slot.state, slot.last_error.clone());
            let context_length = slot.config.context_length;
            self.shared.set_state(&mut slot, SlotState::Loading);
            (previous.0, previous.1, context_length)
        };

        let claim = Claim::new(self.shared.clone());
        let work = self.work();
        let id = id.to_string();
        run_claimed(async move {
            work.load(claim, id, previous_state, previous_error, context_length)
                .await
        })
        .await
    }

    /// Release the slot; does nothing when already empty
    pub async fn unload_model(&self) -> Result<()> {
        let (model_id, handle) = {
            let mut slot = self.shared.lock();
            match slot.state {
                SlotState::Empty => return Ok(()),
                SlotState::Loading | SlotState::Generating | SlotState::Unloading => {
                    return Err(slot.reject("unload the model"));
                }
                SlotState::Ready | SlotState::Error => {}
            }

            let Some(model) = slot.model.as_ref() else {
                // Error with nothing resident
                self.shared.set_state(&mut slot, SlotState::Empty);
                return Ok(());
            };
            let resident = (model.id.clone(), model.handle);
            self.shared.set_state(&mut slot, SlotState::Unloading);
            resident
        };

        let claim = Claim::new(self.shared.clone());
        let work = self.work();
        run_claimed(async move { work.unload(claim, model_id, handle).await }).await
    }

    /// Start a generation; one at a time
    pub async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<GenerationStream> {
        if !self.policy.should_allow_inference() {
            return Err(LifecycleError::InferenceBlocked(
                "battery critically low and not charging".to_string(),
            ));
        }

        let (id, handle, token, config) = {
            let mut slot = self.shared.lock();
            match slot.state {
                SlotState::Ready => {}
                SlotState::Generating => {
                    return Err(LifecycleError::NotReady(
                        "a generation is already in progress".to_string(),
                    ))
                }
                other => return Err(LifecycleError::NotReady(format!("model slot is {}", other))),
            }
            let handle = match slot.model.as_ref() {
                Some(model) => model.handle,
                None => return Err(LifecycleError::NotReady("no model loaded".to_string())),
            };

            let id = self.shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let token = CancellationToken::new();
            slot.generation = Some(ActiveGeneration {
                id,
                token: token.clone(),
            });
            let config = slot.config.clone();
            self.shared.set_state(&mut slot, SlotState::Generating);
            (id, handle, token, config)
        };

        let request = GenerationRequest {
            system_prompt: system_prompt.map(str::to_string),
            prompt: prompt.to_string(),
            config,
        };

        let claim = Claim::new(self.shared.clone());
        let work = self.work();
        run_claimed(async move { work.start_generation(claim, id, handle, token, request).await })
            .await
    }

    /// Collect a whole generation into one string
    pub async fn generate_text(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        let mut stream = self.generate(prompt, system_prompt).await?;
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            text.push_str(&token?);
        }
        Ok(text)
    }

    /// Stop the running generation at its next token boundary
    pub async fn stop(&self) -> Result<()> {
        let handle = {
            let slot = self.shared.lock();
            let Some(generation) = slot.generation.as_ref() else {
                return Ok(());
            };
            generation.token.cancel();
            slot.model.as_ref().map(|m| m.handle)
        };

        if let Some(handle) = handle {
            info!("Stopping generation");
            self.shared.engine.stop(handle).await?;
        }
        Ok(())
    }

    /// Apply a new generation config
    ///
    /// A different context length reloads the resident model before
    /// returning. Rejected with `Busy` while the slot is claimed.
    pub async fn update_config(&self, config: GenerationConfig) -> Result<()> {
        let reload = {
            let mut slot = self.shared.lock();
            if slot.state.is_busy() {
                return Err(LifecycleError::Busy(format!(
                    "cannot change config while the model slot is {}",
                    slot.state
                )));
            }

            let needs_reload = slot.state == SlotState::Ready
                && slot
                    .model
                    .as_ref()
                    .map(|m| m.context_length != config.context_length)
                    .unwrap_or(false);
            slot.config = config.clone();

            if !needs_reload {
                debug!("Generation config updated without reload");
                self.shared.publish(&slot);
                return Ok(());
            }

            let model = slot.model.as_ref().map(|m| (m.id.clone(), m.handle));
            self.shared.set_state(&mut slot, SlotState::Loading);
            model
        };

        let Some((model_id, handle)) = reload else {
            return Ok(());
        };
        info!(
            "Context length changed to {}, reloading {}",
            config.context_length, model_id
        );

        let claim = Claim::new(self.shared.clone());
        let work = self.work();
        run_claimed(async move {
            work.reload(claim, model_id, handle, config.context_length)
                .await
        })
        .await
    }

    /// Resident size reported by the engine; None when nothing is loaded
    pub async fn memory_footprint_mb(&self) -> Result<Option<u64>> {
        let handle = self.shared.lock().model.as_ref().map(|m| m.handle);
        match handle {
            Some(handle) => Ok(Some(self.shared.engine.memory_footprint_mb(handle).await?)),
            None => Ok(None),
        }
    }

    /// Stop any generation, release the model and the backend
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await?;
        for _ in 0..50 {
            if self.state() != SlotState::Generating {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        if let Err(e) = self.unload_model().await {
            warn!("Unload during shutdown failed: {}", e);
        }
        self.shared.engine.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::policy::OptimizationConfig;
    use crate::telemetry::{BatteryReading, BatteryState, DeviceStatus, DeviceThresholds, MemoryReading};
    use crate::testing::{ready_catalog, MockEngine};
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Arc<MockEngine>,
        policy: Arc<OptimizationPolicyEngine>,
        controller: Arc<ModelLifecycleController>,
    }

    async fn fixture(engine: MockEngine) -> Fixture {
        let dir = tempdir().unwrap();
        let catalog = ready_catalog(dir.path(), &["alpha", "beta"]).await;
        let engine = Arc::new(engine);
        let policy = Arc::new(OptimizationPolicyEngine::new(OptimizationConfig::default()));
        let controller = Arc::new(ModelLifecycleController::new(
            engine.clone(),
            catalog,
            policy.clone(),
        ));
        Fixture {
            _dir: dir,
            engine,
            policy,
            controller,
        }
    }

    fn battery(percent: u8, state: BatteryState) -> DeviceStatus {
        DeviceStatus::from_readings(
            MemoryReading {
                total_mb: 8192,
                available_mb: 4096,
            },
            BatteryReading { percent, state },
            &DeviceThresholds::default(),
        )
    }

    #[tokio::test]
    async fn test_load_generate_unload_cycle() {
        let f = fixture(MockEngine::new().with_tokens(&["Hello", ", ", "world"])).await;
        let c = &f.controller;

        assert_eq!(c.state(), SlotState::Empty);
        c.load_model("alpha").await.unwrap();
        assert_eq!(c.state(), SlotState::Ready);
        assert_eq!(c.loaded_model_id().as_deref(), Some("alpha"));

        let text = c.generate_text("hi", Some("be brief")).await.unwrap();
        assert_eq!(text, "Hello, world");
        assert_eq!(c.state(), SlotState::Ready);

        c.unload_model().await.unwrap();
        assert_eq!(c.state(), SlotState::Empty);
        assert_eq!(f.engine.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent_from_empty() {
        let f = fixture(MockEngine::new()).await;
        let mut rx = f.controller.subscribe();
        rx.borrow_and_update();

        f.controller.unload_model().await.unwrap();
        f.controller.unload_model().await.unwrap();
        assert_eq!(f.controller.state(), SlotState::Empty);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_load_switches_models_exclusively() {
        let f = fixture(MockEngine::new()).await;
        f.controller.load_model("alpha").await.unwrap();
        f.controller.load_model("beta").await.unwrap();

        assert_eq!(f.controller.loaded_model_id().as_deref(), Some("beta"));
        assert_eq!(f.engine.resident_count(), 1);
        assert_eq!(f.engine.max_resident(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_never_double_resident() {
        let f = fixture(MockEngine::new().with_load_delay(Duration::from_millis(20))).await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let controller = f.controller.clone();
            let id = if i % 2 == 0 { "alpha" } else { "beta" };
            tasks.push(tokio::spawn(async move { controller.load_model(id).await }));
        }

        let mut succeeded = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(LifecycleError::InvalidTransition { from, .. }) => {
                    assert_eq!(from, SlotState::Loading)
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert!(succeeded >= 1);
        assert_eq!(f.engine.max_resident(), 1);
        assert_eq!(f.engine.resident_count(), 1);
        assert_eq!(f.controller.state(), SlotState::Ready);
    }

    #[tokio::test]
    async fn test_load_unknown_and_missing_models() {
        let f = fixture(MockEngine::new()).await;
        f.controller.load_model("alpha").await.unwrap();

        assert!(matches!(
            f.controller.load_model("nope").await,
            Err(LifecycleError::ModelNotFound(_))
        ));
        assert!(matches!(
            f.controller.load_model("remote-only").await,
            Err(LifecycleError::ModelFileMissing(_))
        ));

        // Previous model untouched
        assert_eq!(f.controller.state(), SlotState::Ready);
        assert_eq!(f.controller.loaded_model_id().as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn test_load_failure_leaves_error_with_nothing_resident() {
        let f = fixture(MockEngine::new()).await;
        f.controller.load_model("alpha").await.unwrap();
        f.engine.set_fail_load(true);

        let err = f.controller.load_model("beta").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Engine(EngineError::LoadFailed(_))));
        assert_eq!(f.controller.state(), SlotState::Error);
        assert!(f.controller.loaded_model_id().is_none());
        assert_eq!(f.engine.resident_count(), 0);
        assert!(f.controller.status().last_error.is_some());

        // Generation is not possible from error
        assert!(matches!(
            f.controller.generate("hi", None).await,
            Err(LifecycleError::NotReady(_))
        ));

        // Explicit recovery
        f.engine.set_fail_load(false);
        f.controller.load_model("beta").await.unwrap();
        assert_eq!(f.controller.state(), SlotState::Ready);
    }

    #[tokio::test]
    async fn test_unload_from_error_clears_slot() {
        let f = fixture(MockEngine::new()).await;
        f.engine.set_fail_load(true);
        assert!(f.controller.load_model("alpha").await.is_err());

        f.controller.unload_model().await.unwrap();
        assert_eq!(f.controller.state(), SlotState::Empty);
        assert!(f.controller.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_unload_failure_keeps_handle_for_retry() {
        let f = fixture(MockEngine::new()).await;
        f.controller.load_model("alpha").await.unwrap();
        f.engine.set_fail_unload(true);

        assert!(matches!(
            f.controller.unload_model().await,
            Err(LifecycleError::Engine(EngineError::UnloadFailed(_)))
        ));
        assert_eq!(f.controller.state(), SlotState::Error);
        assert_eq!(f.controller.loaded_model_id().as_deref(), Some("alpha"));

        f.engine.set_fail_unload(false);
        f.controller.unload_model().await.unwrap();
        assert_eq!(f.controller.state(), SlotState::Empty);
        assert_eq!(f.engine.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_load_while_generating_is_rejected() {
        let f = fixture(
            MockEngine::new()
                .with_tokens(&["a", "b", "c"])
                .with_token_delay(Duration::from_millis(20)),
        )
        .await;
        f.controller.load_model("alpha").await.unwrap();

        let mut stream = f.controller.generate("hi", None).await.unwrap();
        assert_eq!(f.controller.state(), SlotState::Generating);

        assert!(matches!(
            f.controller.load_model("beta").await,
            Err(LifecycleError::InvalidTransition {
                from: SlotState::Generating,
                ..
            })
        ));
        assert_eq!(f.controller.state(), SlotState::Generating);
        assert_eq!(f.controller.loaded_model_id().as_deref(), Some("alpha"));

        while stream.next().await.is_some() {}
        assert_eq!(f.controller.state(), SlotState::Ready);
    }

    #[tokio::test]
    async fn test_single_concurrent_generation() {
        let f = fixture(MockEngine::new().with_tokens(&["a"])).await;
        f.controller.load_model("alpha").await.unwrap();

        let _first = f.controller.generate("one", None).await.unwrap();
        assert!(matches!(
            f.controller.generate("two", None).await,
            Err(LifecycleError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_without_model() {
        let f = fixture(MockEngine::new()).await;
        assert!(matches!(
            f.controller.generate("hi", None).await,
            Err(LifecycleError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_ends_stream_and_restores_ready() {
        let f = fixture(
            MockEngine::new()
                .with_tokens(&["1", "2", "3", "4", "5", "6", "7", "8"])
                .with_token_delay(Duration::from_millis(20)),
        )
        .await;
        f.controller.load_model("alpha").await.unwrap();

        let mut stream = f.controller.generate("count", None).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "1");

        f.controller.stop().await.unwrap();
        assert_eq!(f.engine.stop_calls(), 1);

        let mut rest = Vec::new();
        while let Some(token) = stream.next().await {
            rest.push(token.unwrap());
        }
        assert!(rest.is_empty());
        assert_eq!(f.controller.state(), SlotState::Ready);

        // A fresh generation is not affected by the previous stop
        let text = f.controller.generate_text("again", None).await.unwrap();
        assert_eq!(text, "12345678");
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_slot() {
        let f = fixture(MockEngine::new().with_tokens(&["a", "b"])).await;
        f.controller.load_model("alpha").await.unwrap();

        let stream = f.controller.generate("hi", None).await.unwrap();
        drop(stream);
        assert_eq!(f.controller.state(), SlotState::Ready);
    }

    #[tokio::test]
    async fn test_generation_failure_moves_to_error() {
        let f = fixture(MockEngine::new().with_tokens(&["a", "b"]).failing_generation_after(1)).await;
        f.controller.load_model("alpha").await.unwrap();

        let mut stream = f.controller.generate("hi", None).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(matches!(
            stream.next().await,
            Some(Err(LifecycleError::Engine(EngineError::GenerationFailed(_))))
        ));
        assert_eq!(f.controller.state(), SlotState::Error);
    }

    #[tokio::test]
    async fn test_blocked_by_critical_battery() {
        let f = fixture(MockEngine::new().with_tokens(&["a"])).await;
        f.controller.load_model("alpha").await.unwrap();

        f.policy.evaluate(&battery(8, BatteryState::Discharging));
        assert!(matches!(
            f.controller.generate("hi", None).await,
            Err(LifecycleError::InferenceBlocked(_))
        ));
        assert_eq!(f.controller.state(), SlotState::Ready);

        f.policy.evaluate(&battery(8, BatteryState::Charging));
        assert_eq!(f.controller.generate_text("hi", None).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_update_config_reloads_on_context_change() {
        let f = fixture(MockEngine::new()).await;
        f.controller.load_model("alpha").await.unwrap();
        assert_eq!(f.engine.load_calls().last().unwrap().context_length, 2048);

        let smaller = GenerationConfig::default().halved();
        f.controller.update_config(smaller.clone()).await.unwrap();

        let loads = f.engine.load_calls();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[1].context_length, 1024);
        assert_eq!(f.controller.status().context_length, Some(1024));
        assert_eq!(f.controller.state(), SlotState::Ready);
        assert_eq!(f.engine.max_resident(), 1);

        // Same context length: no reload
        let mut warmer = smaller.clone();
        warmer.temperature = 0.9;
        f.controller.update_config(warmer.clone()).await.unwrap();
        assert_eq!(f.engine.load_calls().len(), 2);
        assert_eq!(f.controller.config(), warmer);
    }

    #[tokio::test]
    async fn test_update_config_without_model_only_stores() {
        let f = fixture(MockEngine::new()).await;
        let config = GenerationConfig::default().halved();
        f.controller.update_config(config.clone()).await.unwrap();
        assert!(f.engine.load_calls().is_empty());

        f.controller.load_model("alpha").await.unwrap();
        assert_eq!(f.engine.load_calls()[0].context_length, 1024);
    }

    #[tokio::test]
    async fn test_update_config_busy_while_generating() {
        let f = fixture(MockEngine::new().with_tokens(&["a"])).await;
        f.controller.load_model("alpha").await.unwrap();

        let _stream = f.controller.generate("hi", None).await.unwrap();
        assert!(matches!(
            f.controller
                .update_config(GenerationConfig::default().halved())
                .await,
            Err(LifecycleError::Busy(_))
        ));
        assert_eq!(f.engine.load_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_footprint() {
        let f = fixture(MockEngine::new()).await;
        assert_eq!(f.controller.memory_footprint_mb().await.unwrap(), None);
        f.controller.load_model("alpha").await.unwrap();
        assert_eq!(
            f.controller.memory_footprint_mb().await.unwrap(),
            Some(MockEngine::FOOTPRINT_MB)
        );
    }

    #[tokio::test]
    async fn test_status_watch_sees_transitions() {
        let f = fixture(MockEngine::new()).await;
        let rx = f.controller.subscribe();
        f.controller.load_model("alpha").await.unwrap();

        let status = rx.borrow().clone();
        assert_eq!(status.state, SlotState::Ready);
        assert_eq!(status.model_id.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn test_abandoned_load_still_settles_the_slot() {
        let f = fixture(MockEngine::new().with_load_delay(Duration::from_millis(200))).await;

        let attempt =
            tokio::time::timeout(Duration::from_millis(20), f.controller.load_model("alpha")).await;
        assert!(attempt.is_err());
        assert_eq!(f.controller.state(), SlotState::Loading);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.controller.state(), SlotState::Ready);
        assert_eq!(f.controller.loaded_model_id().as_deref(), Some("alpha"));

        f.controller.load_model("beta").await.unwrap();
        assert_eq!(f.controller.loaded_model_id().as_deref(), Some("beta"));
        assert_eq!(f.engine.max_resident(), 1);

        f.controller.unload_model().await.unwrap();
        assert_eq!(f.engine.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_reload_still_settles_the_slot() {
        let f = fixture(MockEngine::new().with_load_delay(Duration::from_millis(100))).await;
        f.controller.load_model("alpha").await.unwrap();

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            f.controller.update_config(GenerationConfig::default().halved()),
        )
        .await;
        assert!(attempt.is_err());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = f.controller.status();
        assert_eq!(status.state, SlotState::Ready);
        assert_eq!(status.context_length, Some(1024));
        assert_eq!(f.engine.resident_count(), 1);
    }
}
