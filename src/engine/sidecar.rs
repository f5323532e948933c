//! Sidecar generation engine
//!
//! Runs the inference library in a separate process and talks newline
//! delimited JSON-RPC over stdin/stdout. Replies are routed back to callers
//! by request id, so `stop` can be sent while a generation is streaming.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use super::provider::{
    EngineError, EngineHandle, GenerationEngine, GenerationRequest, LoadParams, TokenStream,
};

const BYTES_PER_MB: u64 = 1024 * 1024;

// ============================================================================
// JSON-RPC Types
// ============================================================================

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: u64,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

type Reply = Result<Value, EngineError>;

struct PendingCall {
    sender: mpsc::UnboundedSender<Reply>,
    /// Streaming calls stay registered until a `done` result or an error
    streaming: bool,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingCall>>>;

fn is_done(result: &Value) -> bool {
    result.get("done").and_then(|d| d.as_bool()).unwrap_or(false)
}

/// Route one reply line to its caller
fn dispatch(pending: &PendingMap, line: &str) {
    let response: JsonRpcResponse = match serde_json::from_str(line) {
        Ok(response) => response,
        Err(e) => {
            log::warn!("Ignoring malformed sidecar line: {}", e);
            return;
        }
    };

    let mut calls = match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let finished = match (&response.error, &response.result) {
        (Some(_), _) => true,
        (None, Some(result)) => calls
            .get(&response.id)
            .map(|call| !call.streaming || is_done(result))
            .unwrap_or(true),
        (None, None) => true,
    };

    let call = if finished {
        calls.remove(&response.id)
    } else {
        None
    };
    let sender = match call.as_ref() {
        Some(call) => Some(&call.sender),
        None => calls.get(&response.id).map(|c| &c.sender),
    };

    let Some(sender) = sender else {
        log::debug!("Reply for unknown request {}", response.id);
        return;
    };

    let reply = match (response.error, response.result) {
        (Some(error), _) => Err(EngineError::Protocol(format!(
            "{} (code {})",
            error.message, error.code
        ))),
        (None, Some(result)) => Ok(result),
        (None, None) => Err(EngineError::Protocol("Empty response".to_string())),
    };
    // Caller may have dropped its stream
    let _ = sender.send(reply);
}

/// Read reply lines until EOF; outstanding calls fail when the process exits
fn spawn_reader<R>(reader: R, pending: PendingMap) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => dispatch(&pending, &line),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read from sidecar: {}", e);
                    break;
                }
            }
        }

        log::info!("Sidecar output closed");
        let mut calls = match pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, call) in calls.drain() {
            let _ = call
                .sender
                .send(Err(EngineError::Unavailable("Sidecar exited".to_string())));
        }
    })
}

/// Turn streamed `{token}` results into a token stream ending at `{done}`
fn token_stream(receiver: mpsc::UnboundedReceiver<Reply>) -> TokenStream {
    futures_util::stream::unfold(Some(receiver), |state| async move {
        let mut receiver = state?;
        loop {
            match receiver.recv().await {
                None => {
                    return Some((
                        Err(EngineError::Protocol("Stream ended without completion".to_string())),
                        None,
                    ))
                }
                Some(Err(e)) => return Some((Err(map_generation_error(e)), None)),
                Some(Ok(result)) => {
                    let done = is_done(&result);
                    if let Some(token) = result.get("token").and_then(|t| t.as_str()) {
                        let next = if done { None } else { Some(receiver) };
                        return Some((Ok(token.to_string()), next));
                    }
                    if done {
                        return None;
                    }
                }
            }
        }
    })
    .boxed()
}

fn map_generation_error(error: EngineError) -> EngineError {
    match error {
        EngineError::Protocol(message) => EngineError::GenerationFailed(message),
        other => other,
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SidecarConfig {
    /// Path to the sidecar binary; searched next to the executable when unset
    pub sidecar_path: Option<PathBuf>,
}

// ============================================================================
// Sidecar Process
// ============================================================================

struct SidecarProcess {
    child: Child,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl SidecarProcess {
    async fn send(&self, method: &str, params: Value, streaming: bool) -> Result<mpsc::UnboundedReceiver<Reply>, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut calls = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            calls.insert(id, PendingCall { sender, streaming });
        }

        let mut line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| EngineError::Protocol(format!("Failed to serialize request: {}", e)))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            if let Ok(mut calls) = self.pending.lock() {
                calls.remove(&id);
            }
            return Err(EngineError::Unavailable(format!(
                "Failed to write to sidecar: {}",
                e
            )));
        }

        Ok(receiver)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let mut receiver = self.send(method, params, false).await?;
        receiver
            .recv()
            .await
            .unwrap_or_else(|| Err(EngineError::Unavailable("Sidecar exited".to_string())))
    }

    fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }
}

// ============================================================================
// Engine Implementation
// ============================================================================

pub struct SidecarEngine {
    config: SidecarConfig,
    process: tokio::sync::Mutex<Option<Arc<SidecarProcess>>>,
}

impl SidecarEngine {
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config,
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Find the sidecar binary path
    fn find_sidecar_path(&self) -> Result<PathBuf, EngineError> {
        if let Some(ref path) = self.config.sidecar_path {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        let sidecar_name = if cfg!(windows) {
            "llm-sidecar.exe"
        } else {
            "llm-sidecar"
        };

        if let Ok(exe_path) = std::env::current_exe() {
            let exe_dir = exe_path.parent().unwrap_or(Path::new("."));

            // Same directory as main exe (bundled app)
            let path = exe_dir.join(sidecar_name);
            if path.exists() {
                log::debug!("Found sidecar in exe dir: {}", path.display());
                return Ok(path);
            }

            // Dev builds where the exe is in target/debug
            let mut current = exe_dir;
            for _ in 0..3 {
                if let Some(parent) = current.parent() {
                    for profile in &["debug", "release"] {
                        let path = parent.join("target").join(profile).join(sidecar_name);
                        if path.exists() {
                            log::debug!("Found sidecar at: {}", path.display());
                            return Ok(path);
                        }
                    }
                    current = parent;
                }
            }
        }

        Err(EngineError::Unavailable(format!(
            "Sidecar binary {} not found",
            sidecar_name
        )))
    }

    async fn spawn(&self) -> Result<SidecarProcess, EngineError> {
        let sidecar_path = self.find_sidecar_path()?;
        log::info!("Starting generation sidecar: {}", sidecar_path.display());

        let mut cmd = Command::new(&sidecar_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Unavailable(format!("Failed to start sidecar: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Unavailable("Failed to get sidecar stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Unavailable("Failed to get sidecar stdout".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = spawn_reader(stdout, pending.clone());

        Ok(SidecarProcess {
            child,
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(0),
            reader,
        })
    }

    /// Running sidecar, respawned if it died
    async fn ensure_process(&self) -> Result<Arc<SidecarProcess>, EngineError> {
        let mut guard = self.process.lock().await;
        if let Some(process) = guard.as_ref() {
            if process.is_alive() {
                return Ok(process.clone());
            }
            log::warn!("Sidecar exited, restarting");
        }

        let process = Arc::new(self.spawn().await?);
        *guard = Some(process.clone());
        Ok(process)
    }

    /// Current process without spawning one
    async fn running_process(&self) -> Option<Arc<SidecarProcess>> {
        self.process
            .lock()
            .await
            .as_ref()
            .filter(|p| p.is_alive())
            .cloned()
    }
}

fn parse_handle(result: &Value) -> Result<EngineHandle, EngineError> {
    result
        .get("handle")
        .and_then(|h| h.as_u64())
        .map(EngineHandle)
        .ok_or_else(|| EngineError::Protocol("Missing handle in load_model reply".to_string()))
}

#[async_trait]
impl GenerationEngine for SidecarEngine {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    async fn load(&self, path: &Path, params: LoadParams) -> Result<EngineHandle, EngineError> {
        let process = self.ensure_process().await?;
        let result = process
            .call(
                "load_model",
                json!({
                    "path": path.to_string_lossy(),
                    "context_length": params.context_length,
                    "batch_size": params.batch_size,
                }),
            )
            .await
            .map_err(|e| match e {
                EngineError::Protocol(message) => EngineError::LoadFailed(message),
                other => other,
            })?;

        let handle = parse_handle(&result)?;
        log::info!("Sidecar loaded {} as handle {}", path.display(), handle.0);
        Ok(handle)
    }

    async fn generate(
        &self,
        handle: EngineHandle,
        request: GenerationRequest,
    ) -> Result<TokenStream, EngineError> {
        let process = self
            .running_process()
            .await
            .ok_or(EngineError::InvalidHandle(handle.0))?;

        let config = &request.config;
        let receiver = process
            .send(
                "generate",
                json!({
                    "handle": handle.0,
                    "system_prompt": request.system_prompt,
                    "prompt": request.prompt,
                    "max_tokens": config.max_tokens,
                    "temperature": config.temperature,
                    "top_p": config.top_p,
                    "top_k": config.top_k,
                    "repeat_penalty": config.repeat_penalty,
                }),
                true,
            )
            .await?;

        Ok(token_stream(receiver))
    }

    async fn stop(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let Some(process) = self.running_process().await else {
            return Ok(());
        };
        process.call("stop", json!({ "handle": handle.0 })).await?;
        Ok(())
    }

    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let Some(process) = self.running_process().await else {
            // Process gone, nothing resident
            return Ok(());
        };
        process
            .call("unload_model", json!({ "handle": handle.0 }))
            .await
            .map_err(|e| match e {
                EngineError::Protocol(message) => EngineError::UnloadFailed(message),
                other => other,
            })?;
        log::info!("Sidecar unloaded handle {}", handle.0);
        Ok(())
    }

    async fn memory_footprint_mb(&self, handle: EngineHandle) -> Result<u64, EngineError> {
        let process = self
            .running_process()
            .await
            .ok_or(EngineError::InvalidHandle(handle.0))?;
        let result = process
            .call("memory_usage", json!({ "handle": handle.0 }))
            .await?;
        let bytes = result
            .get("bytes")
            .and_then(|b| b.as_u64())
            .ok_or_else(|| EngineError::Protocol("Missing bytes in memory_usage reply".to_string()))?;
        Ok(bytes.div_ceil(BYTES_PER_MB))
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        let Some(process) = self.process.lock().await.take() else {
            return Ok(());
        };

        let _ = process.call("shutdown", json!({})).await;
        match Arc::try_unwrap(process) {
            Ok(mut process) => {
                let _ = process.child.kill().await;
            }
            Err(_) => log::debug!("Sidecar still referenced, it exits when released"),
        }
        log::info!("Sidecar engine shut down");
        Ok(())
    }
}
