//! Error taxonomy for the processor, per spec.md §7.
//!
//! One [`PsepError`] variant per category; [`PsepError::kind`] classifies an
//! error for callers that want to branch on category without matching the
//! full enum (mirrors `StatusCode`/`ErrorExt` in the source ecosystem's
//! `cocode-error` crate).

use snafu::Location;
use snafu::Snafu;
use strum::Display;

/// Coarse classification of a [`PsepError`], independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PsepErrorKind {
    /// Fatal at `ProcessorConfigBuilder::build()` time.
    Configuration,
    /// A claim CAS or extension failed; the owning work package must abort.
    ClaimLost,
    /// The token store is transiently unreachable.
    StoreUnavailable,
    /// The upstream message source is transiently unreachable.
    StreamUnavailable,
    /// A handler invocation failed and was not absorbed by rollback policy.
    HandlerFailure,
    /// Split/merge/reset requested against a store or handler that does not
    /// support it.
    UnsupportedOperation,
    /// An operation was attempted from a state that forbids it.
    IllegalState,
}

/// Unified error type for the processor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module)]
pub enum PsepError {
    #[snafu(display("configuration error: {message}"))]
    Configuration {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("claim lost for segment {segment_id}: {message}"))]
    ClaimLost {
        segment_id: u64,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("token store unavailable: {message}"))]
    StoreUnavailable {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("message source unavailable: {message}"))]
    StreamUnavailable {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("handler failed for segment {segment_id}: {message}"))]
    HandlerFailure {
        segment_id: u64,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("unsupported operation: {operation}"))]
    UnsupportedOperation {
        operation: &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("illegal state: {message}"))]
    IllegalState {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
}

impl PsepError {
    /// Classify this error per spec.md §7's taxonomy.
    pub fn kind(&self) -> PsepErrorKind {
        match self {
            PsepError::Configuration { .. } => PsepErrorKind::Configuration,
            PsepError::ClaimLost { .. } => PsepErrorKind::ClaimLost,
            PsepError::StoreUnavailable { .. } => PsepErrorKind::StoreUnavailable,
            PsepError::StreamUnavailable { .. } => PsepErrorKind::StreamUnavailable,
            PsepError::HandlerFailure { .. } => PsepErrorKind::HandlerFailure,
            PsepError::UnsupportedOperation { .. } => PsepErrorKind::UnsupportedOperation,
            PsepError::IllegalState { .. } => PsepErrorKind::IllegalState,
        }
    }

    /// Convenience constructor for the common "illegal state" case.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        psep_error::IllegalStateSnafu {
            message: message.into(),
        }
        .build()
    }

    /// Convenience constructor for [`PsepErrorKind::UnsupportedOperation`].
    pub fn unsupported(operation: &'static str) -> Self {
        psep_error::UnsupportedOperationSnafu { operation }.build()
    }
}

/// Result type used throughout the crate.
pub type Result<T, E = PsepError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = PsepError::illegal_state("start() during shutdown");
        assert_eq!(err.kind(), PsepErrorKind::IllegalState);
        assert!(err.to_string().contains("illegal state"));
    }

    #[test]
    fn unsupported_carries_operation_name() {
        let err = PsepError::unsupported("splitSegment");
        assert_eq!(err.kind(), PsepErrorKind::UnsupportedOperation);
        assert!(err.to_string().contains("splitSegment"));
    }
}
