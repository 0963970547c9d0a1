//! In-memory test doubles, gated behind the `test-util` feature so
//! downstream integration tests can reuse them without reimplementing the
//! consumed interfaces.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PsepError;
use crate::error::Result;
use crate::error::psep_error;
use crate::handler::EventHandlerInvoker;
use crate::segment::Segment;
use crate::source::AvailabilityCallback;
use crate::source::BlockingStream;
use crate::source::StreamableMessageSource;
use crate::source::TrackedEvent;
use crate::source::VecStream;
use crate::token::store::TokenStore;
use crate::token::tracking_token::TrackingToken;

struct SegmentRow {
    token: TrackingToken,
    owner: Option<String>,
}

/// A single-process [`TokenStore`] backed by a mutex-guarded map, suitable
/// for tests and single-node deployments. Claims are owner-exclusive but
/// never expire on their own; callers drive extension/release explicitly.
pub struct InMemoryTokenStore {
    segments: Mutex<HashMap<(String, u64), SegmentRow>>,
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        InMemoryTokenStore {
            segments: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn initialize_token_segments(
        &self,
        processor: &str,
        count: u32,
        initial_token: TrackingToken,
    ) -> Result<()> {
        let mut segments = self.segments.lock().unwrap();
        for id in 0..count as u64 {
            let key = (processor.to_string(), id);
            if segments.contains_key(&key) {
                return psep_error::ConfigurationSnafu {
                    message: format!("segment {id} already initialized for {processor}"),
                }
                .fail();
            }
            segments.insert(
                key,
                SegmentRow {
                    token: initial_token.clone(),
                    owner: None,
                },
            );
        }
        Ok(())
    }

    async fn fetch_segments(&self, processor: &str) -> Result<Vec<u64>> {
        let segments = self.segments.lock().unwrap();
        let mut ids: Vec<u64> = segments
            .keys()
            .filter(|(name, _)| name == processor)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn fetch_token(&self, processor: &str, segment_id: u64, owner_id: &str) -> Result<TrackingToken> {
        let mut segments = self.segments.lock().unwrap();
        let row = segments
            .get_mut(&(processor.to_string(), segment_id))
            .ok_or_else(|| PsepError::illegal_state(format!("no such segment {segment_id}")))?;
        match &row.owner {
            Some(owner) if owner != owner_id => {
                return psep_error::ClaimLostSnafu {
                    segment_id,
                    message: format!("already claimed by {owner}"),
                }
                .fail();
            }
            _ => {}
        }
        row.owner = Some(owner_id.to_string());
        Ok(row.token.clone())
    }

    async fn extend_claim(&self, processor: &str, segment_id: u64, owner_id: &str) -> Result<()> {
        let segments = self.segments.lock().unwrap();
        let row = segments
            .get(&(processor.to_string(), segment_id))
            .ok_or_else(|| PsepError::illegal_state(format!("no such segment {segment_id}")))?;
        match &row.owner {
            Some(owner) if owner == owner_id => Ok(()),
            _ => psep_error::ClaimLostSnafu {
                segment_id,
                message: "claim no longer held".to_string(),
            }
            .fail(),
        }
    }

    async fn store_token(
        &self,
        processor: &str,
        segment_id: u64,
        owner_id: &str,
        token: TrackingToken,
    ) -> Result<()> {
        let mut segments = self.segments.lock().unwrap();
        let row = segments
            .get_mut(&(processor.to_string(), segment_id))
            .ok_or_else(|| PsepError::illegal_state(format!("no such segment {segment_id}")))?;
        match &row.owner {
            Some(owner) if owner == owner_id => {
                row.token = token;
                Ok(())
            }
            _ => psep_error::ClaimLostSnafu {
                segment_id,
                message: "claim no longer held".to_string(),
            }
            .fail(),
        }
    }

    async fn release_claim(&self, processor: &str, segment_id: u64, owner_id: &str) {
        let mut segments = self.segments.lock().unwrap();
        if let Some(row) = segments.get_mut(&(processor.to_string(), segment_id)) {
            if row.owner.as_deref() == Some(owner_id) {
                row.owner = None;
            }
        }
    }

    fn requires_explicit_segment_initialization(&self) -> bool {
        true
    }

    fn retrieve_storage_identifier(&self) -> Option<String> {
        Some("in-memory".to_string())
    }

    async fn initialize_segment(&self, processor: &str, segment_id: u64, token: TrackingToken) -> Result<()> {
        let mut segments = self.segments.lock().unwrap();
        segments.insert(
            (processor.to_string(), segment_id),
            SegmentRow { token, owner: None },
        );
        Ok(())
    }

    async fn delete_segment(&self, processor: &str, segment_id: u64) -> Result<()> {
        let mut segments = self.segments.lock().unwrap();
        segments.remove(&(processor.to_string(), segment_id));
        Ok(())
    }
}

/// Wraps an [`InMemoryTokenStore`] but always fails `extend_claim`, used to
/// exercise the claim-extension-failure path of the work package loop
/// without waiting for a real lease to time out.
pub struct AlwaysFailExtendTokenStore {
    inner: InMemoryTokenStore,
}

impl Default for AlwaysFailExtendTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AlwaysFailExtendTokenStore {
    pub fn new() -> Self {
        AlwaysFailExtendTokenStore {
            inner: InMemoryTokenStore::new(),
        }
    }
}

#[async_trait]
impl TokenStore for AlwaysFailExtendTokenStore {
    async fn initialize_token_segments(
        &self,
        processor: &str,
        count: u32,
        initial_token: TrackingToken,
    ) -> Result<()> {
        self.inner.initialize_token_segments(processor, count, initial_token).await
    }

    async fn fetch_segments(&self, processor: &str) -> Result<Vec<u64>> {
        self.inner.fetch_segments(processor).await
    }

    async fn fetch_token(&self, processor: &str, segment_id: u64, owner_id: &str) -> Result<TrackingToken> {
        self.inner.fetch_token(processor, segment_id, owner_id).await
    }

    async fn extend_claim(&self, _processor: &str, segment_id: u64, _owner_id: &str) -> Result<()> {
        psep_error::ClaimLostSnafu {
            segment_id,
            message: "extend_claim always fails in this test double".to_string(),
        }
        .fail()
    }

    async fn store_token(
        &self,
        processor: &str,
        segment_id: u64,
        owner_id: &str,
        token: TrackingToken,
    ) -> Result<()> {
        self.inner.store_token(processor, segment_id, owner_id, token).await
    }

    async fn release_claim(&self, processor: &str, segment_id: u64, owner_id: &str) {
        self.inner.release_claim(processor, segment_id, owner_id).await
    }

    fn requires_explicit_segment_initialization(&self) -> bool {
        self.inner.requires_explicit_segment_initialization()
    }

    fn retrieve_storage_identifier(&self) -> Option<String> {
        self.inner.retrieve_storage_identifier()
    }

    async fn initialize_segment(&self, processor: &str, segment_id: u64, token: TrackingToken) -> Result<()> {
        self.inner.initialize_segment(processor, segment_id, token).await
    }

    async fn delete_segment(&self, processor: &str, segment_id: u64) -> Result<()> {
        self.inner.delete_segment(processor, segment_id).await
    }
}

/// A handle to one currently-open [`VecStream`], kept by the backing
/// [`VecMessageSource`] so `publish` can reach it after it was opened.
struct OpenStreamHandle {
    queue: Arc<Mutex<VecDeque<TrackedEvent>>>,
    callback: Arc<Mutex<Option<AvailabilityCallback>>>,
    wake: mpsc::UnboundedSender<()>,
    closed: Arc<AtomicBool>,
}

/// A fixed in-memory event log, optionally supporting push-notification
/// callbacks, used by the crate's own tests and exported for downstream use.
pub struct VecMessageSource {
    events: Mutex<Vec<TrackedEvent>>,
    supports_push: bool,
    open_streams: Mutex<Vec<OpenStreamHandle>>,
}

impl VecMessageSource {
    pub fn new(supports_push: bool) -> Self {
        VecMessageSource {
            events: Mutex::new(Vec::new()),
            supports_push,
            open_streams: Mutex::new(Vec::new()),
        }
    }

    pub fn with_events(events: Vec<TrackedEvent>, supports_push: bool) -> Self {
        VecMessageSource {
            events: Mutex::new(events),
            supports_push,
            open_streams: Mutex::new(Vec::new()),
        }
    }

    /// Append an event to the log and deliver it to every currently open
    /// stream, invoking each one's registered availability callback and
    /// waking any blocked `next_available`/`has_next_available` caller.
    pub fn publish(&self, event: TrackedEvent) {
        self.events.lock().unwrap().push(event.clone());
        let mut streams = self.open_streams.lock().unwrap();
        streams.retain(|handle| {
            if handle.closed.load(Ordering::Relaxed) {
                return false;
            }
            handle.queue.lock().unwrap().push_back(event.clone());
            if let Some(callback) = handle.callback.lock().unwrap().as_ref() {
                callback();
            }
            let _ = handle.wake.send(());
            true
        });
    }
}

#[async_trait]
impl StreamableMessageSource for VecMessageSource {
    async fn open_stream(&self, from_token: Option<TrackingToken>) -> Result<Box<dyn BlockingStream>> {
        let from_position = from_token.and_then(|t| t.position()).unwrap_or(-1);
        let events: VecDeque<TrackedEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.token.position().unwrap_or(-1) > from_position)
            .cloned()
            .collect();

        let queue = Arc::new(Mutex::new(events));
        let callback = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        self.open_streams.lock().unwrap().push(OpenStreamHandle {
            queue: queue.clone(),
            callback: callback.clone(),
            wake: tx,
            closed: closed.clone(),
        });

        Ok(Box::new(VecStream {
            queue,
            callback,
            supports_push: self.supports_push,
            more_events: rx,
            closed,
        }))
    }

    async fn create_tail_token(&self) -> Result<TrackingToken> {
        let events = self.events.lock().unwrap();
        Ok(match events.last() {
            Some(event) => event.token.clone(),
            None => TrackingToken::at(-1),
        })
    }

    async fn create_head_token(&self) -> Result<TrackingToken> {
        Ok(TrackingToken::at(-1))
    }
}

/// Applies every event to a shared set, recording `(segment_id, routing_key)`
/// pairs it has seen. Never fails; useful as a baseline double in tests that
/// assert on at-least-once delivery rather than handler failure paths.
#[derive(Default)]
pub struct NoopEventHandlerInvoker;

#[async_trait]
impl EventHandlerInvoker for NoopEventHandlerInvoker {
    fn can_handle_type(&self, _payload_type: &str) -> bool {
        true
    }

    async fn can_handle(&self, _event: &TrackedEvent, _segment: Segment) -> bool {
        true
    }

    async fn handle(&self, _event: &TrackedEvent, _segment: Segment) -> Result<()> {
        Ok(())
    }
}

/// Records every `(segment_id, routing_key)` pair it handles, and can be
/// configured to fail on specific routing keys — used to exercise the
/// rollback/abort paths of the batch algorithm.
pub struct RecordingEventHandlerInvoker {
    seen: Mutex<Vec<(u64, u64)>>,
    fail_on: Mutex<HashSet<u64>>,
}

impl Default for RecordingEventHandlerInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingEventHandlerInvoker {
    pub fn new() -> Self {
        RecordingEventHandlerInvoker {
            seen: Mutex::new(Vec::new()),
            fail_on: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_on_routing_key(&self, routing_key: u64) {
        self.fail_on.lock().unwrap().insert(routing_key);
    }

    pub fn seen(&self) -> Vec<(u64, u64)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandlerInvoker for RecordingEventHandlerInvoker {
    fn can_handle_type(&self, _payload_type: &str) -> bool {
        true
    }

    async fn can_handle(&self, _event: &TrackedEvent, _segment: Segment) -> bool {
        true
    }

    async fn handle(&self, event: &TrackedEvent, segment: Segment) -> Result<()> {
        if self.fail_on.lock().unwrap().contains(&event.routing_key) {
            return psep_error::HandlerFailureSnafu {
                segment_id: segment.id,
                message: format!("configured to fail on routing key {}", event.routing_key),
            }
            .fail();
        }
        self.seen.lock().unwrap().push((segment.id, event.routing_key));
        Ok(())
    }
}

/// An [`EventHandlerInvoker`] that supports `resetTokens`, recording how many
/// times `performReset` was invoked and the last context it was passed with.
pub struct ResettableEventHandlerInvoker {
    reset_count: AtomicU32,
    last_context: Mutex<Option<String>>,
}

impl Default for ResettableEventHandlerInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResettableEventHandlerInvoker {
    pub fn new() -> Self {
        ResettableEventHandlerInvoker {
            reset_count: AtomicU32::new(0),
            last_context: Mutex::new(None),
        }
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<String> {
        self.last_context.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandlerInvoker for ResettableEventHandlerInvoker {
    fn can_handle_type(&self, _payload_type: &str) -> bool {
        true
    }

    async fn can_handle(&self, _event: &TrackedEvent, _segment: Segment) -> bool {
        true
    }

    async fn handle(&self, _event: &TrackedEvent, _segment: Segment) -> Result<()> {
        Ok(())
    }

    fn supports_reset(&self) -> bool {
        true
    }

    async fn perform_reset(&self, context: Option<&str>) -> Result<()> {
        self.reset_count.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock().unwrap() = context.map(|s| s.to_string());
        Ok(())
    }
}
