//! Event Handler Invoker consumed interface (spec.md §4.3).

use async_trait::async_trait;

use crate::error::Result;
use crate::segment::Segment;
use crate::source::TrackedEvent;

/// Filters and applies events for a single segment (spec.md §4.3).
#[async_trait]
pub trait EventHandlerInvoker: Send + Sync {
    /// Coarse filter: `false` if no handler anywhere can ever process this
    /// payload type. When `false` for *all* known types for a given event,
    /// the Coordinator may skip it entirely (spec.md §4.5 step 4c).
    fn can_handle_type(&self, payload_type: &str) -> bool;

    /// Fine filter: `false` means the event is explicitly skipped for
    /// `segment` without invoking [`EventHandlerInvoker::handle`].
    async fn can_handle(&self, event: &TrackedEvent, segment: Segment) -> bool;

    /// Apply `event` to `segment`. May fail; see spec.md §4.4 step 4 for
    /// rollback/error-handling semantics around failures here.
    async fn handle(&self, event: &TrackedEvent, segment: Segment) -> Result<()>;

    /// `true` if this handler chain supports [`EventHandlerInvoker::perform_reset`].
    fn supports_reset(&self) -> bool {
        false
    }

    /// Invoked from the façade's reset flow, only while the processor is
    /// stopped (spec.md §4.6 `resetTokens`).
    async fn perform_reset(&self, context: Option<&str>) -> Result<()> {
        let _ = context;
        Ok(())
    }
}
