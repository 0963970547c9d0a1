//! `StreamingEventProcessor`: the public lifecycle and administration
//! façade over a coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::Shared;
use futures::FutureExt;
use tokio::sync::Mutex;

use crate::config::ProcessorConfig;
use crate::coordinator;
use crate::coordinator::CoordinatorHandle;
use crate::error::PsepError;
use crate::error::Result;
use crate::handler::EventHandlerInvoker;
use crate::status::ProcessingStatus;
use crate::token::store::TokenStore;
use crate::token::tracking_token::TrackingToken;

/// Façade lifecycle state, independent of the coordinator's own internal
/// running/backoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FacadeState {
    NotStarted,
    Running,
    ShuttingDown,
    Stopped,
}

type ShutdownFuture = Shared<futures::future::BoxFuture<'static, ()>>;

/// The pooled streaming event processor itself: `start`/`shutdown`, status
/// reporting, and segment administration (split/merge/release/reset).
pub struct StreamingEventProcessor {
    config: ProcessorConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    state: FacadeState,
    coordinator: Option<Arc<CoordinatorHandle>>,
    shutdown_future: Option<ShutdownFuture>,
}

impl StreamingEventProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        StreamingEventProcessor {
            config,
            inner: Mutex::new(Inner {
                state: FacadeState::NotStarted,
                coordinator: None,
                shutdown_future: None,
            }),
        }
    }

    /// Starts the coordinator task. A no-op if already `Running`; fails
    /// with `illegalState` while `ShuttingDown`.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            FacadeState::Running => Ok(()),
            FacadeState::ShuttingDown => Err(PsepError::illegal_state("start() called while shutting down")),
            FacadeState::NotStarted | FacadeState::Stopped => {
                let handle = coordinator::spawn(self.config.clone());
                inner.coordinator = Some(Arc::new(handle));
                inner.state = FacadeState::Running;
                inner.shutdown_future = None;
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .try_lock()
            .map(|inner| inner.state == FacadeState::Running)
            .unwrap_or(false)
    }

    /// `true` iff the coordinator is currently in its `Paused-Error` state.
    pub async fn is_error(&self) -> bool {
        let inner = self.inner.lock().await;
        match &inner.coordinator {
            Some(handle) => handle.is_error().await,
            None => false,
        }
    }

    pub async fn processing_status(&self) -> HashMap<u64, ProcessingStatus> {
        let inner = self.inner.lock().await;
        match &inner.coordinator {
            Some(handle) => handle.processing_status().await,
            None => HashMap::new(),
        }
    }

    /// `true` iff any segment's current token is a Replay Token not yet
    /// caught up (Design Notes "Replay detection").
    pub async fn is_replaying(&self) -> bool {
        self.processing_status()
            .await
            .values()
            .any(|status| status.is_replaying)
    }

    /// Blocking shutdown: equivalent to awaiting [`Self::shutdown_async`].
    pub async fn shut_down(&self) {
        self.shutdown_async().await;
    }

    /// Idempotent asynchronous shutdown: repeated calls before the next
    /// `start()` return the same completion future.
    pub async fn shutdown_async(&self) -> ShutdownFuture {
        let mut inner = self.inner.lock().await;
        if let Some(future) = &inner.shutdown_future {
            return future.clone();
        }

        let future: ShutdownFuture = match inner.state {
            FacadeState::NotStarted => futures::future::ready(()).boxed().shared(),
            _ => {
                inner.state = FacadeState::ShuttingDown;
                let coordinator = inner.coordinator.take();
                async move {
                    if let Some(handle) = coordinator {
                        match Arc::try_unwrap(handle) {
                            Ok(handle) => handle.shutdown().await,
                            Err(handle) => {
                                // Another clone outlives us (e.g. a concurrent
                                // split/merge caller); releasing our
                                // reference is the best we can do here.
                                drop(handle);
                            }
                        }
                    }
                }
                .boxed()
                .shared()
            }
        };

        inner.shutdown_future = Some(future.clone());
        future
    }

    pub fn supports_reset(&self) -> bool {
        self.config.event_handler_invoker.supports_reset()
    }

    /// Default `MAX_INT16`, per spec's glossary of defaults.
    pub fn max_capacity(&self) -> i32 {
        i16::MAX as i32
    }

    pub fn get_token_store_identifier(&self) -> Option<String> {
        self.config.token_store.retrieve_storage_identifier()
    }

    pub async fn release_segment(&self, segment_id: u64) -> Result<()> {
        let inner = self.inner.lock().await;
        let handle = inner
            .coordinator
            .as_ref()
            .ok_or_else(|| PsepError::illegal_state("processor is not running"))?;
        handle.release_segment(segment_id);
        Ok(())
    }

    pub async fn split_segment(&self, segment_id: u64) -> Result<bool> {
        let coordinator = self.coordinator_handle().await?;
        Ok(coordinator.split_segment(segment_id).await)
    }

    pub async fn merge_segment(&self, segment_id: u64) -> Result<bool> {
        let coordinator = self.coordinator_handle().await?;
        Ok(coordinator.merge_segment(segment_id).await)
    }

    /// Permitted only while the façade is stopped (`NotStarted` or
    /// `Stopped`); dispatched through the last coordinator's control
    /// channel is not possible once it has exited, so this drives the
    /// reset directly against the token store and handler instead.
    pub async fn reset_tokens(&self, initial_token: Option<TrackingToken>, context: Option<String>) -> Result<()> {
        let inner = self.inner.lock().await;
        if inner.state == FacadeState::Running || inner.state == FacadeState::ShuttingDown {
            return Err(PsepError::illegal_state("resetTokens requires the processor to be stopped"));
        }
        if !self.config.event_handler_invoker.supports_reset() {
            return Err(PsepError::unsupported("resetTokens"));
        }

        let owner_id = uuid::Uuid::new_v4().to_string();
        let segment_ids = self.config.token_store.fetch_segments(&self.config.name).await?;
        for segment_id in segment_ids {
            // The pre-reset persisted token marks the boundary below which
            // events are replayed (spec.md §3 "Replay Token"). It must be
            // fetched independently of `initial_token`, which only supplies
            // the new starting position.
            let existing = self
                .config
                .token_store
                .fetch_token(&self.config.name, segment_id, &owner_id)
                .await?;
            let reset_position = existing.position().unwrap_or(-1);
            let start = initial_token.clone().unwrap_or_else(|| existing.clone());

            let replay = TrackingToken::replaying(start, reset_position);
            self.config
                .token_store
                .store_token(&self.config.name, segment_id, &owner_id, replay)
                .await?;
            self.config.token_store.release_claim(&self.config.name, segment_id, &owner_id).await;
        }

        self.config.event_handler_invoker.perform_reset(context.as_deref()).await
    }

    async fn coordinator_handle(&self) -> Result<Arc<CoordinatorHandle>> {
        let inner = self.inner.lock().await;
        inner
            .coordinator
            .clone()
            .ok_or_else(|| PsepError::illegal_state("processor is not running"))
    }
}

#[cfg(test)]
#[path = "processor.test.rs"]
mod tests;
