//! Token stream handed to generation callers
//!
//! Wraps the engine stream with the per-call cancellation token. The token is
//! checked on every poll, so after `stop()` the stream ends at the next token
//! boundary. Completion, stop, failure or an early drop each hand the slot
//! back exactly once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use log::debug;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::controller::{GenerationOutcome, Shared};
use crate::engine::{EngineHandle, TokenStream};
use crate::error::Result;

struct GenerationGuard {
    shared: Arc<Shared>,
    id: u64,
    handle: EngineHandle,
    token: CancellationToken,
    finished: bool,
}

impl GenerationGuard {
    fn finish(&mut self, outcome: GenerationOutcome) {
        if !self.finished {
            self.finished = true;
            self.shared.finish_generation(self.id, outcome);
        }
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!("Generation stream dropped before completion");
        self.token.cancel();
        self.finish(GenerationOutcome::Stopped);

        // The backend may still be producing tokens nobody reads
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let engine = self.shared.engine.clone();
            let handle = self.handle;
            runtime.spawn(async move {
                if let Err(e) = engine.stop(handle).await {
                    debug!("Engine stop after drop failed: {}", e);
                }
            });
        }
    }
}

pub struct GenerationStream {
    inner: TokenStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    guard: GenerationGuard,
}

impl GenerationStream {
    pub(super) fn new(
        shared: Arc<Shared>,
        id: u64,
        handle: EngineHandle,
        token: CancellationToken,
        inner: TokenStream,
    ) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.clone().cancelled_owned()),
            guard: GenerationGuard {
                shared,
                id,
                handle,
                token,
                finished: false,
            },
        }
    }

    /// Token that stops this generation when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.guard.token.clone()
    }

    pub fn stop(&self) {
        self.guard.token.cancel();
    }
}

impl Stream for GenerationStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.guard.finished {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            debug!("Generation {} stopped", this.guard.id);
            this.guard.finish(GenerationOutcome::Stopped);
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(token))) => Poll::Ready(Some(Ok(token))),
            Poll::Ready(Some(Err(e))) => {
                this.guard.finish(GenerationOutcome::Failed(e.to_string()));
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.guard.finish(GenerationOutcome::Completed);
                Poll::Ready(None)
            }
        }
    }
}
