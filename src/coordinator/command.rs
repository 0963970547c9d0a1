//! Control-task queue: the single-threaded command channel through which
//! segment lifecycle operations are serialized against live dispatch.

use tokio::sync::oneshot;

/// One entry in the coordinator's FIFO control-task queue.
///
/// `resetTokens` is not represented here: it is only ever permitted while
/// the façade is stopped, at which point no coordinator task is running to
/// receive it — see [`crate::processor::StreamingEventProcessor::reset_tokens`].
pub enum ControlTask {
    ReleaseSegment {
        segment_id: u64,
    },
    SplitSegment {
        segment_id: u64,
        reply: oneshot::Sender<bool>,
    },
    MergeSegment {
        segment_id: u64,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
