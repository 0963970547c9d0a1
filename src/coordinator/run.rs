//! The coordinator's main loop: claim, stream, dispatch, control, liveness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Notify;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::ProcessorConfig;
use crate::coordinator::command::ControlTask;
use crate::coordinator::state::CoordinatorState;
use crate::coordinator::state::ErrorBackoff;
use crate::coordinator::state::HoldDown;
use crate::error::PsepError;
use crate::handler::EventHandlerInvoker;
use crate::segment::Segment;
use crate::segment::initial_partition;
use crate::source::AvailabilityCallback;
use crate::source::BlockingStream;
use crate::source::StreamableMessageSource;
use crate::source::TrackedEvent;
use crate::status::ProcessingStatus;
use crate::token::store::TokenStore;
use crate::token::tracking_token::TrackingToken;
use crate::work_package;
use crate::work_package::WorkPackageHandle;
use crate::work_package::WorkPackageParams;
use crate::work_package::WorkPackageState;

/// Minimum time between two polling-fallback `has_next_available` calls
/// when the source does not support push notification.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// How far (in stream positions) the lowest claimed token may advance past
/// the position the currently open stream was opened from before the
/// Coordinator closes it and reopens from the new lowest position
/// (spec.md §4.5 step 2, second reopen condition).
const STREAM_REOPEN_DRIFT: i64 = 1_000;

/// Owner identity for claims this processor instance holds. One per
/// coordinator instance, stable for its lifetime.
fn new_owner_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// How far `advanced` has moved past `baseline`, in stream positions.
/// `0` if either token lacks a concrete position.
fn token_drift(advanced: Option<&TrackingToken>, baseline: Option<&TrackingToken>) -> i64 {
    match (advanced.and_then(|t| t.position()), baseline.and_then(|t| t.position())) {
        (Some(a), Some(b)) => a - b,
        _ => 0,
    }
}

pub(crate) struct Coordinator {
    pub(crate) config: ProcessorConfig,
    pub(crate) owner_id: String,
    pub(crate) tasks_rx: mpsc::UnboundedReceiver<ControlTask>,
    pub(crate) status: Arc<RwLock<HashMap<u64, ProcessingStatus>>>,
    pub(crate) state: Arc<RwLock<CoordinatorState>>,
    pub(crate) notify: Arc<Notify>,

    work_packages: HashMap<u64, WorkPackageHandle>,
    stream: Option<Box<dyn BlockingStream>>,
    /// The token the currently open stream was opened from, used to detect
    /// drift against `lowest_claimed_token` (spec.md §4.5 step 2).
    stream_from: Option<TrackingToken>,
    held_down: HashMap<u64, HoldDown>,
    backoff: ErrorBackoff,
    /// Masks for segments this coordinator knows about, beyond the canonical
    /// initial partition (populated as split/merge create new ids).
    known_masks: HashMap<u64, u64>,
}

impl Coordinator {
    pub(crate) fn new(
        config: ProcessorConfig,
        tasks_rx: mpsc::UnboundedReceiver<ControlTask>,
        status: Arc<RwLock<HashMap<u64, ProcessingStatus>>>,
        state: Arc<RwLock<CoordinatorState>>,
        notify: Arc<Notify>,
    ) -> Self {
        Coordinator {
            config,
            owner_id: new_owner_id(),
            tasks_rx,
            status,
            state,
            notify,
            work_packages: HashMap::new(),
            stream: None,
            stream_from: None,
            held_down: HashMap::new(),
            backoff: ErrorBackoff::new(),
            known_masks: HashMap::new(),
        }
    }

    /// Runs until a `Shutdown` control task is received, then releases every
    /// claim and returns.
    pub(crate) async fn run(mut self) {
        match self.ensure_segments_initialized().await {
            Ok(()) => *self.state.write().await = CoordinatorState::Running,
            Err(err) => {
                error!(error = %err, "failed to initialize token segments");
                *self.state.write().await = CoordinatorState::PausedError;
            }
        }

        loop {
            if matches!(*self.state.read().await, CoordinatorState::PausedError) {
                let wait = self.backoff.next();
                warn!(wait_ms = wait.as_millis() as u64, "coordinator backing off");
                tokio::time::sleep(wait).await;
                *self.state.write().await = CoordinatorState::Running;
            }

            self.claim_phase().await;

            if let Err(err) = self.ensure_stream().await {
                warn!(error = %err, "failed to open stream, entering backoff");
                *self.state.write().await = CoordinatorState::PausedError;
                if self.drain_control_tasks().await {
                    break;
                }
                continue;
            }
            self.backoff.reset();

            self.dispatch_phase().await;

            if self.drain_control_tasks().await {
                break;
            }
            self.liveness_phase().await;
            self.sync_status().await;
            if self.wait_for_next_iteration().await {
                break;
            }
        }

        self.shutdown_all_work_packages().await;
        *self.state.write().await = CoordinatorState::Stopped;
    }

    async fn ensure_segments_initialized(&self) -> Result<(), PsepError> {
        let existing = self.config.token_store.fetch_segments(&self.config.name).await?;
        if existing.is_empty() {
            let initial_token = (self.config.initial_token)(self.config.message_source.clone()).await?;
            self.config
                .token_store
                .initialize_token_segments(&self.config.name, self.config.initial_segment_count, initial_token)
                .await?;
            info!(
                processor = %self.config.name,
                count = self.config.initial_segment_count,
                "initialized token segments"
            );
        }
        Ok(())
    }

    /// Step 1: enumerate segments, claim what we can up to the cap.
    async fn claim_phase(&mut self) {
        let now = Instant::now();
        self.held_down.retain(|_, hold| hold.until > now);

        let segment_ids = match self.config.token_store.fetch_segments(&self.config.name).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "fetch_segments failed");
                *self.state.write().await = CoordinatorState::PausedError;
                return;
            }
        };

        for segment_id in segment_ids {
            if self.work_packages.len() as u32 >= self.config.max_claimed_segments {
                break;
            }
            if self.work_packages.contains_key(&segment_id) || self.held_down.contains_key(&segment_id) {
                continue;
            }

            match self
                .config
                .token_store
                .fetch_token(&self.config.name, segment_id, &self.owner_id)
                .await
            {
                Ok(token) => self.spawn_work_package(segment_id, token),
                Err(err) => {
                    debug!(segment_id, error = %err, "unable to claim segment");
                }
            }
        }
    }

    fn spawn_work_package(&mut self, segment_id: u64, token: TrackingToken) {
        let mask = self.segment_mask_for(segment_id);
        let segment = Segment::new(segment_id, mask);
        let handle = work_package::spawn(WorkPackageParams {
            processor_name: self.config.name.clone(),
            owner_id: self.owner_id.clone(),
            segment,
            initial_token: token,
            token_store: self.config.token_store.clone(),
            handler: self.config.event_handler_invoker.clone(),
            transaction_manager: self.config.transaction_manager.clone(),
            rollback_configuration: self.config.rollback_configuration.clone(),
            batch_size: self.config.batch_size,
            claim_extension_threshold: self.config.claim_extension_threshold,
        });
        info!(segment_id, "claimed segment");
        self.work_packages.insert(segment_id, handle);
    }

    /// Masks aren't persisted by the (ambient) token store rows modeled
    /// here; segments claimed from the initial partition use the canonical
    /// Axon mask, and segments created by `splitSegment` register their mask
    /// directly when spawned (see `split_segment`). This lazily recomputes
    /// the canonical mask for ids that came from the initial partition.
    fn segment_mask_for(&self, segment_id: u64) -> u64 {
        if let Some(mask) = self.known_masks.get(&segment_id).copied() {
            return mask;
        }
        initial_partition(self.config.initial_segment_count)
            .into_iter()
            .find(|s| s.id == segment_id)
            .map(|s| s.mask)
            .unwrap_or(0)
    }

    async fn ensure_stream(&mut self) -> Result<(), PsepError> {
        let lowest = self.lowest_claimed_token().await;

        if self.stream.is_some() {
            if token_drift(lowest.as_ref(), self.stream_from.as_ref()) <= STREAM_REOPEN_DRIFT {
                return Ok(());
            }
            debug!("lowest claimed token drifted past stream head, reopening stream");
            if let Some(mut stream) = self.stream.take() {
                stream.close().await;
            }
        }

        let mut stream = self.config.message_source.open_stream(lowest.clone()).await?;

        let notify = self.notify.clone();
        let callback: AvailabilityCallback = Box::new(move || notify.notify_one());
        let supports_push = stream.set_on_available_callback(callback);
        debug!(supports_push, "stream opened");

        self.stream = Some(stream);
        self.stream_from = lowest;
        Ok(())
    }

    async fn lowest_claimed_token(&self) -> Option<TrackingToken> {
        let mut lowest: Option<TrackingToken> = None;
        for wp in self.work_packages.values() {
            let token = wp.current_token().await;
            lowest = Some(match lowest {
                Some(existing) if existing.covers(&token) => token,
                Some(existing) => existing,
                None => token,
            });
        }
        lowest
    }

    /// Step 4: fan out available events to work packages with capacity.
    /// Takes ownership of `self.stream` for the duration so this method and
    /// `deliver_to` can freely borrow the rest of `self`.
    async fn dispatch_phase(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        loop {
            if self.work_packages.values().all(|wp| !wp.has_remaining_capacity()) {
                break;
            }
            let Some(event) = stream.peek().await else {
                break;
            };

            let covering: Vec<u64> = self
                .work_packages
                .iter()
                .filter(|(_, wp)| wp.segment().matches(event.routing_key))
                .map(|(id, _)| *id)
                .collect();

            let needing = self.needing_segments(&covering, &event).await;

            if needing.is_empty() {
                let _ = stream.next_available().await;
                continue;
            }

            if !self.config.event_handler_invoker.can_handle_type(event.payload_type) {
                stream.skip_messages_with_payload_type_of(&event);
            }

            if !self.deliver_to(&needing, event).await {
                break;
            }

            if stream.next_available().await.is_err() {
                return;
            }
        }

        self.stream = Some(stream);
    }

    /// Narrow `covering` to the segments that have not already processed
    /// past `event`'s token. A work package whose `current_token` already
    /// covers the event's position has seen it before (stream reopened
    /// further back than its own progress); redelivering it would regress
    /// `currentToken`, so it is excluded here instead (spec.md §4.5 step 4b).
    async fn needing_segments(&self, covering: &[u64], event: &TrackedEvent) -> Vec<u64> {
        let mut needing = Vec::with_capacity(covering.len());
        for segment_id in covering {
            if let Some(wp) = self.work_packages.get(segment_id) {
                if !wp.current_token().await.covers(&event.token) {
                    needing.push(*segment_id);
                }
            }
        }
        needing
    }

    /// Schedule `event` on each of `needing`'s work packages. Returns
    /// `false` if any of them is out of capacity (the caller should stop
    /// dispatching rather than silently drop the event).
    async fn deliver_to(&mut self, needing: &[u64], event: TrackedEvent) -> bool {
        for segment_id in needing {
            if let Some(wp) = self.work_packages.get(segment_id) {
                if !wp.schedule_event(event.clone()).await {
                    return false;
                }
                wp.schedule_batch_processing();
            }
        }
        true
    }

    /// Drains and runs every control task currently queued (FIFO), per
    /// spec step 5. Does not block waiting for new ones. Returns `true` if
    /// a `Shutdown` task was among them, meaning the caller must stop the
    /// loop.
    async fn drain_control_tasks(&mut self) -> bool {
        while let Ok(task) = self.tasks_rx.try_recv() {
            if self.run_control_task(task).await {
                return true;
            }
        }
        false
    }

    /// Runs one control task. Returns `true` iff it was a `Shutdown` task.
    async fn run_control_task(&mut self, task: ControlTask) -> bool {
        match task {
            ControlTask::ReleaseSegment { segment_id } => {
                self.release_segment(segment_id).await;
                false
            }
            ControlTask::SplitSegment { segment_id, reply } => {
                let ok = self.split_segment(segment_id).await;
                let _ = reply.send(ok);
                false
            }
            ControlTask::MergeSegment { segment_id, reply } => {
                let ok = self.merge_segment(segment_id).await;
                let _ = reply.send(ok);
                false
            }
            ControlTask::Shutdown { reply } => {
                let _ = reply.send(());
                true
            }
        }
    }

    async fn release_segment(&mut self, segment_id: u64) {
        if let Some(wp) = self.work_packages.remove(&segment_id) {
            wp.abort("releaseSegment").await;
        }
        self.held_down.insert(
            segment_id,
            HoldDown {
                until: Instant::now() + 2 * self.config.token_claim_interval,
            },
        );
        info!(segment_id, "released segment");
    }

    async fn split_segment(&mut self, segment_id: u64) -> bool {
        if !self.config.token_store.requires_explicit_segment_initialization() {
            warn!(segment_id, "split requested but store does not support it");
            return false;
        }
        let Some(wp) = self.work_packages.remove(&segment_id) else {
            return false;
        };
        let segment = wp.segment();
        let token = wp.current_token().await;
        wp.abort("splitSegment").await;

        let (primary, sibling) = segment.split();
        if let Err(err) = self
            .config
            .token_store
            .initialize_segment(&self.config.name, sibling.id, token.clone())
            .await
        {
            error!(segment_id, error = %err, "split: failed to initialize sibling segment");
            self.spawn_work_package(segment.id, token);
            self.known_masks.insert(primary.id, segment.mask);
            return false;
        }

        self.known_masks.insert(primary.id, primary.mask);
        self.known_masks.insert(sibling.id, sibling.mask);

        let claimed_primary = self
            .config
            .token_store
            .fetch_token(&self.config.name, primary.id, &self.owner_id)
            .await;
        let claimed_sibling = self
            .config
            .token_store
            .fetch_token(&self.config.name, sibling.id, &self.owner_id)
            .await;

        match (claimed_primary, claimed_sibling) {
            (Ok(t1), Ok(t2)) => {
                self.spawn_work_package(primary.id, t1);
                self.spawn_work_package(sibling.id, t2);
                info!(parent = segment_id, primary = primary.id, sibling = sibling.id, "split segment");
                true
            }
            _ => {
                warn!(segment_id, "split: failed to re-claim halves after init");
                false
            }
        }
    }

    async fn merge_segment(&mut self, segment_id: u64) -> bool {
        if !self.config.token_store.requires_explicit_segment_initialization() {
            warn!(segment_id, "merge requested but store does not support it");
            return false;
        }
        let Some(primary_wp) = self.work_packages.get(&segment_id) else {
            return false;
        };
        let primary_segment = primary_wp.segment();
        let sibling_id = primary_segment.sibling_id();
        let Some(sibling_wp) = self.work_packages.get(&sibling_id) else {
            warn!(segment_id, sibling_id, "merge: sibling not owned locally");
            return false;
        };
        let sibling_segment = sibling_wp.segment();
        let Some(merged) = primary_segment.merge_with(&sibling_segment) else {
            warn!(segment_id, sibling_id, "merge: segments are not siblings");
            return false;
        };

        let primary_wp = self.work_packages.remove(&segment_id).unwrap();
        let sibling_wp = self.work_packages.remove(&sibling_id).unwrap();
        let token = primary_wp.current_token().await;
        primary_wp.abort("mergeSegment").await;
        sibling_wp.abort("mergeSegment").await;

        if let Err(err) = self
            .config
            .token_store
            .delete_segment(&self.config.name, sibling_id)
            .await
        {
            error!(sibling_id, error = %err, "merge: failed to delete sibling row");
            return false;
        }
        if let Err(err) = self
            .config
            .token_store
            .store_token(&self.config.name, merged.id, &self.owner_id, token.clone())
            .await
        {
            error!(segment_id = merged.id, error = %err, "merge: failed to persist merged token");
            return false;
        }

        self.known_masks.insert(merged.id, merged.mask);
        match self
            .config
            .token_store
            .fetch_token(&self.config.name, merged.id, &self.owner_id)
            .await
        {
            Ok(merged_token) => {
                self.spawn_work_package(merged.id, merged_token);
                info!(merged = merged.id, absorbed = sibling_id, "merged segments");
                true
            }
            Err(err) => {
                warn!(segment_id = merged.id, error = %err, "merge: failed to re-claim merged segment");
                false
            }
        }
    }

    /// Step 6: reap aborted work packages.
    async fn liveness_phase(&mut self) {
        let aborted: Vec<u64> = {
            let mut ids = Vec::new();
            for (id, wp) in self.work_packages.iter() {
                if wp.state().await == WorkPackageState::Aborted {
                    ids.push(*id);
                }
            }
            ids
        };
        for id in aborted {
            if let Some(wp) = self.work_packages.remove(&id) {
                warn!(segment_id = id, errors = wp.error_count(), "work package aborted, reaping");
                wp.abort("reaped").await;
            }
        }
    }

    async fn sync_status(&self) {
        let tail_position = self
            .config
            .message_source
            .create_tail_token()
            .await
            .ok()
            .and_then(|t| t.position());

        let mut snapshot = HashMap::new();
        for (id, wp) in self.work_packages.iter() {
            let token = wp.current_token().await;
            let is_caught_up = match (token.position(), tail_position) {
                (Some(pos), Some(tail)) => pos >= tail,
                _ => false,
            };
            snapshot.insert(*id, ProcessingStatus::from_token(&token, is_caught_up, wp.error_count()));
        }
        *self.status.write().await = snapshot;
    }

    /// Step 7: sleep until the next signal or the claim-interval deadline.
    /// Returns `true` if a `Shutdown` task arrived and the loop must stop.
    async fn wait_for_next_iteration(&mut self) -> bool {
        let poll_interval = self.poll_interval();
        tokio::select! {
            biased;
            task = self.tasks_rx.recv() => {
                match task {
                    Some(task) => self.run_control_task(task).await,
                    None => true,
                }
            }
            _ = self.notify.notified() => false,
            _ = tokio::time::sleep(poll_interval) => false,
        }
    }

    fn poll_interval(&self) -> Duration {
        if self
            .stream
            .as_ref()
            .map(|_| false)
            .unwrap_or(true)
        {
            self.config.token_claim_interval
        } else {
            POLL_TIMEOUT.min(self.config.token_claim_interval)
        }
    }

    async fn shutdown_all_work_packages(&mut self) {
        for (_, wp) in self.work_packages.drain() {
            wp.abort("shutdown").await;
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close().await;
        }
    }
}
