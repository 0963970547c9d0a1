//! Batch algorithm and public contract for a single Work Package
//! (spec.md §4.4).

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Notify;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::RollbackConfiguration;
use crate::handler::EventHandlerInvoker;
use crate::segment::Segment;
use crate::source::TrackedEvent;
use crate::token::store::TokenStore;
use crate::token::tracking_token::TrackingToken;
use crate::transaction::TransactionManager;
use crate::work_package::state::WorkPackageState;

/// `K` in "pending < batchSize * K" (spec.md §4.4 `hasRemainingCapacity`):
/// the queue can hold twice a full batch before backpressure kicks in.
const QUEUE_CAPACITY_FACTOR: usize = 2;

/// Everything [`spawn`] needs to start a Work Package for one claimed
/// segment.
pub struct WorkPackageParams {
    pub processor_name: String,
    pub owner_id: String,
    pub segment: Segment,
    pub initial_token: TrackingToken,
    pub token_store: Arc<dyn TokenStore>,
    pub handler: Arc<dyn EventHandlerInvoker>,
    pub transaction_manager: Arc<dyn TransactionManager>,
    pub rollback_configuration: RollbackConfiguration,
    pub batch_size: usize,
    pub claim_extension_threshold: Duration,
}

/// Handle to a running Work Package, held exclusively by the Coordinator's
/// control task (spec.md §4.4 "Public contract: called only by the
/// Coordinator's control task").
pub struct WorkPackageHandle {
    segment: Segment,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    sender: mpsc::Sender<TrackedEvent>,
    current_token: Arc<RwLock<TrackingToken>>,
    last_delivered_token: Arc<RwLock<TrackingToken>>,
    error_count: Arc<AtomicU32>,
    state: Arc<RwLock<WorkPackageState>>,
    join: JoinHandle<()>,
}

impl WorkPackageHandle {
    pub fn segment(&self) -> Segment {
        self.segment
    }

    /// Append `event` to the pending queue; no-op (returns `false`) if
    /// aborted. Returns whether the event was accepted.
    pub async fn schedule_event(&self, event: TrackedEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let token = event.token.clone();
        match self.sender.try_send(event) {
            Ok(()) => {
                *self.last_delivered_token.write().await = token;
                true
            }
            Err(_) => false,
        }
    }

    /// Idempotent signal that the queue has work (spec.md §4.4).
    pub fn schedule_batch_processing(&self) {
        self.notify.notify_one();
    }

    /// `true` iff pending events are below `batchSize * K`.
    pub fn has_remaining_capacity(&self) -> bool {
        self.sender.capacity() > 0
    }

    /// The highest token *scheduled* so far, not necessarily processed.
    pub async fn last_delivered_token(&self) -> TrackingToken {
        self.last_delivered_token.read().await.clone()
    }

    /// The highest token actually persisted by this work package so far.
    pub async fn current_token(&self) -> TrackingToken {
        self.current_token.read().await.clone()
    }

    pub async fn state(&self) -> WorkPackageState {
        *self.state.read().await
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Mark aborted and wait for the in-flight batch to finish and the
    /// claim to be released (spec.md §4.4 `abort(reason) -> completion`).
    pub async fn abort(self, reason: &str) {
        info!(segment_id = self.segment.id, reason, "aborting work package");
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Spawn a Work Package task for `params.segment`, returning a handle the
/// Coordinator uses to feed it events and eventually tear it down.
pub fn spawn(params: WorkPackageParams) -> WorkPackageHandle {
    let WorkPackageParams {
        processor_name,
        owner_id,
        segment,
        initial_token,
        token_store,
        handler,
        transaction_manager,
        rollback_configuration,
        batch_size,
        claim_extension_threshold,
    } = params;

    let queue_capacity = (batch_size * QUEUE_CAPACITY_FACTOR).max(1);
    let (tx, rx) = mpsc::channel(queue_capacity);
    let cancel = CancellationToken::new();
    let notify = Arc::new(Notify::new());
    let current_token = Arc::new(RwLock::new(initial_token.clone()));
    let last_delivered_token = Arc::new(RwLock::new(initial_token.clone()));
    let error_count = Arc::new(AtomicU32::new(0));
    let state = Arc::new(RwLock::new(WorkPackageState::Scheduled));

    let join = tokio::spawn(run(RunContext {
        processor_name,
        owner_id,
        segment,
        token_store,
        handler,
        transaction_manager,
        rollback_configuration,
        batch_size,
        claim_extension_threshold,
        rx,
        cancel: cancel.clone(),
        notify: notify.clone(),
        current_token: current_token.clone(),
        state: state.clone(),
        error_count: error_count.clone(),
    }));

    WorkPackageHandle {
        segment,
        cancel,
        notify,
        sender: tx,
        current_token,
        last_delivered_token,
        error_count,
        state,
        join,
    }
}

struct RunContext {
    processor_name: String,
    owner_id: String,
    segment: Segment,
    token_store: Arc<dyn TokenStore>,
    handler: Arc<dyn EventHandlerInvoker>,
    transaction_manager: Arc<dyn TransactionManager>,
    rollback_configuration: RollbackConfiguration,
    batch_size: usize,
    claim_extension_threshold: Duration,
    rx: mpsc::Receiver<TrackedEvent>,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    current_token: Arc<RwLock<TrackingToken>>,
    state: Arc<RwLock<WorkPackageState>>,
    error_count: Arc<AtomicU32>,
}

/// The batch loop described by spec.md §4.4.
async fn run(mut ctx: RunContext) {
    let mut last_extension_at = Instant::now();

    'outer: loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        *ctx.state.write().await = WorkPackageState::Idle;

        let first_event = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break 'outer,
            maybe = ctx.rx.recv() => maybe,
            _ = tokio::time::sleep(ctx.claim_extension_threshold) => {
                if last_extension_at.elapsed() >= ctx.claim_extension_threshold
                    && !extend_claim(&ctx, &mut last_extension_at).await
                {
                    break 'outer;
                }
                continue;
            }
            _ = ctx.notify.notified() => continue,
        };

        let Some(first_event) = first_event else {
            // Channel closed: coordinator dropped the sender.
            break;
        };

        *ctx.state.write().await = WorkPackageState::Running;

        let mut batch = Vec::with_capacity(ctx.batch_size);
        batch.push(first_event);
        while batch.len() < ctx.batch_size {
            match ctx.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }

        if last_extension_at.elapsed() >= ctx.claim_extension_threshold
            && !extend_claim(&ctx, &mut last_extension_at).await
        {
            break 'outer;
        }

        if !run_batch(&mut ctx, batch).await {
            break 'outer;
        }
    }

    ctx.token_store
        .release_claim(&ctx.processor_name, ctx.segment.id, &ctx.owner_id)
        .await;
    *ctx.state.write().await = WorkPackageState::Aborted;
    debug!(segment_id = ctx.segment.id, "work package aborted, claim released");
}

/// Attempts a claim extension; returns `false` (and leaves the caller to
/// abort) on failure, per spec.md §4.4 step 2: "on failure -> abort with
/// `claimLost`".
async fn extend_claim(ctx: &RunContext, last_extension_at: &mut Instant) -> bool {
    match ctx
        .token_store
        .extend_claim(&ctx.processor_name, ctx.segment.id, &ctx.owner_id)
        .await
    {
        Ok(()) => {
            *last_extension_at = Instant::now();
            true
        }
        Err(err) => {
            warn!(
                segment_id = ctx.segment.id,
                error = %err,
                "claim extension failed, aborting work package"
            );
            ctx.error_count.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// Runs one batch to completion. Returns `false` if the work package should
/// abort afterwards (spec.md §4.4 steps 3-5).
async fn run_batch(ctx: &mut RunContext, batch: Vec<TrackedEvent>) -> bool {
    let mut transaction = match ctx.transaction_manager.begin().await {
        Ok(tx) => Some(tx),
        Err(err) => {
            error!(segment_id = ctx.segment.id, error = %err, "failed to open transaction");
            ctx.error_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
    };

    let mut last_committed_token: Option<TrackingToken> = None;
    let mut should_abort = false;

    for event in &batch {
        if ctx.handler.can_handle(event, ctx.segment).await {
            match ctx.handler.handle(event, ctx.segment).await {
                Ok(()) => last_committed_token = Some(event.token.clone()),
                Err(err) => {
                    ctx.error_count.fetch_add(1, Ordering::Relaxed);
                    let roll_back = (ctx.rollback_configuration)(&err);
                    error!(
                        segment_id = ctx.segment.id,
                        error = %err,
                        roll_back,
                        "handler failed"
                    );
                    if roll_back {
                        if let Some(tx) = transaction.take() {
                            let _ = tx.rollback().await;
                        }
                        return false;
                    }
                    // Not rolled back: commit progress up to (but not
                    // including) the failing event, then abort.
                    should_abort = true;
                    break;
                }
            }
        } else {
            // Explicitly filtered out: counts as handled for the
            // at-least-once invariant (spec.md §8 invariant 3).
            last_committed_token = Some(event.token.clone());
        }
    }

    if let Some(token) = last_committed_token {
        if let Err(err) = ctx
            .token_store
            .store_token(&ctx.processor_name, ctx.segment.id, &ctx.owner_id, token.clone())
            .await
        {
            error!(segment_id = ctx.segment.id, error = %err, "store_token failed, claim lost");
            ctx.error_count.fetch_add(1, Ordering::Relaxed);
            if let Some(tx) = transaction.take() {
                let _ = tx.rollback().await;
            }
            return false;
        }
        *ctx.current_token.write().await = token;
    }

    if let Some(tx) = transaction.take() {
        if let Err(err) = tx.commit().await {
            error!(segment_id = ctx.segment.id, error = %err, "transaction commit failed");
            ctx.error_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
    }

    !should_abort
}

#[cfg(test)]
#[path = "package.test.rs"]
mod tests;
