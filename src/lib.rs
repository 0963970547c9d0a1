//! Pooled Streaming Event Processor: consumes an append-only, totally
//! ordered event stream, partitions it into independently advancing
//! segments, and dispatches events to a user-supplied handler with
//! at-least-once delivery per segment and exclusive ownership across a
//! distributed fleet.

mod coordinator;
mod work_package;

pub mod config;
pub mod error;
pub mod handler;
pub mod segment;
pub mod source;
pub mod status;
pub mod token;
pub mod transaction;

mod processor;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::ProcessorConfig;
pub use config::ProcessorConfigBuilder;
pub use error::PsepError;
pub use error::PsepErrorKind;
pub use error::Result;
pub use processor::StreamingEventProcessor;
pub use segment::Segment;
pub use status::ProcessingStatus;
pub use token::tracking_token::GlobalSequence;
pub use token::tracking_token::TrackingToken;
