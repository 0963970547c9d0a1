//! Streamable Message Source consumed interface (spec.md §4.2).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::token::tracking_token::TrackingToken;

/// A single event read from the upstream stream.
#[derive(Debug, Clone)]
pub struct TrackedEvent {
    pub token: TrackingToken,
    /// The "sequencing identifier" spec.md §4.5 step 4d routes on.
    pub routing_key: u64,
    pub payload_type: &'static str,
    pub payload: Vec<u8>,
}

/// Notifies a waiting Coordinator that a new event may be available. The
/// source invokes this synchronously from its own publishing thread/task
/// (spec.md §9 "Open question — availability-callback reentry"): it must be
/// a fast signal only, never one that blocks or does handler work.
pub type AvailabilityCallback = Box<dyn Fn() + Send + Sync>;

/// Opens a position-ordered, seekable cursor over the upstream stream
/// (spec.md §4.2).
#[async_trait]
pub trait StreamableMessageSource: Send + Sync {
    /// Opens a stream starting after `from_token` (`None` means "from the
    /// beginning").
    async fn open_stream(
        &self,
        from_token: Option<TrackingToken>,
    ) -> Result<Box<dyn BlockingStream>>;

    /// A token positioned at the current tail of the stream.
    async fn create_tail_token(&self) -> Result<TrackingToken>;

    /// A token positioned at the very beginning of the stream.
    async fn create_head_token(&self) -> Result<TrackingToken>;

    /// A token positioned at `since` ago, if the source can resolve
    /// wall-clock positions.
    async fn create_token_since(&self, since: Duration) -> Result<TrackingToken> {
        let _ = since;
        Err(crate::error::PsepError::unsupported("createTokenSince"))
    }
}

/// A position-ordered cursor over [`TrackedEvent`]s, returned by
/// [`StreamableMessageSource::open_stream`].
///
/// Named `BlockingStream` per spec.md §4.2 for contract fidelity; per
/// spec.md §9 / §2.1 of SPEC_FULL.md, this crate's concurrency model
/// realizes "blocking" as `async fn`, not an OS-thread-blocking call — a
/// genuinely blocking implementation is the source's concern, wrapped
/// internally with `tokio::task::spawn_blocking`.
#[async_trait]
pub trait BlockingStream: Send {
    /// Look at the next event without consuming it.
    async fn peek(&mut self) -> Option<TrackedEvent>;

    /// `true` if an event becomes available within `timeout`.
    async fn has_next_available(&mut self, timeout: Duration) -> bool;

    /// Consume and return the next event, waiting indefinitely if needed.
    async fn next_available(&mut self) -> Result<TrackedEvent>;

    /// Hint that future events carrying the same payload type as `event`
    /// need not be delivered (spec.md §4.5 step 4c).
    fn skip_messages_with_payload_type_of(&mut self, event: &TrackedEvent);

    /// Register a push-notification callback. Returns `true` iff the
    /// source actually supports push notification; when `false` the
    /// Coordinator must fall back to time-bounded polling.
    fn set_on_available_callback(&mut self, callback: AvailabilityCallback) -> bool;

    /// Release any resources held by this stream.
    async fn close(&mut self);
}

/// An in-memory [`BlockingStream`] over a queue shared with the backing
/// [`VecMessageSource`](crate::testing::VecMessageSource), used by that
/// source and this crate's own test suite. The queue and callback are
/// shared (rather than owned) so a publish that arrives after the stream
/// is open is still visible to it.
pub(crate) struct VecStream {
    pub(crate) queue: Arc<Mutex<VecDeque<TrackedEvent>>>,
    pub(crate) callback: Arc<Mutex<Option<AvailabilityCallback>>>,
    pub(crate) supports_push: bool,
    /// Receives a wakeup whenever the backing `VecMessageSource` appends
    /// more events (so `has_next_available` can actually wait).
    pub(crate) more_events: mpsc::UnboundedReceiver<()>,
    /// Set by `close`; tells the backing source to stop feeding this stream.
    pub(crate) closed: Arc<AtomicBool>,
}

#[async_trait]
impl BlockingStream for VecStream {
    async fn peek(&mut self) -> Option<TrackedEvent> {
        self.queue.lock().unwrap().front().cloned()
    }

    async fn has_next_available(&mut self, timeout: Duration) -> bool {
        if !self.queue.lock().unwrap().is_empty() {
            return true;
        }
        matches!(
            tokio::time::timeout(timeout, self.more_events.recv()).await,
            Ok(Some(()))
        ) || !self.queue.lock().unwrap().is_empty()
    }

    async fn next_available(&mut self) -> Result<TrackedEvent> {
        loop {
            if let Some(event) = self.queue.lock().unwrap().pop_front() {
                return Ok(event);
            }
            if self.more_events.recv().await.is_none() {
                return Err(crate::error::PsepError::unsupported("streamClosed"));
            }
        }
    }

    fn skip_messages_with_payload_type_of(&mut self, event: &TrackedEvent) {
        self.queue.lock().unwrap().retain(|e| e.payload_type != event.payload_type);
    }

    fn set_on_available_callback(&mut self, callback: AvailabilityCallback) -> bool {
        *self.callback.lock().unwrap() = Some(callback);
        self.supports_push
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        self.queue.lock().unwrap().clear();
    }
}
