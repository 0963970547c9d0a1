//! Coordinator lifecycle states.

use std::time::Instant;

/// Internal coordinator state, distinct from the façade's own
/// `NotStarted -> Running -> ShuttingDown -> Stopped` state machine: this
/// tracks the health of the main loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Starting,
    Running,
    /// The stream or store is unreachable; retry after `backoff_until`.
    PausedError,
    Stopping,
    Stopped,
}

/// Exponential backoff for `Paused-Error`, capped, reset on next success.
pub struct ErrorBackoff {
    current: std::time::Duration,
    cap: std::time::Duration,
}

impl ErrorBackoff {
    pub fn new() -> Self {
        ErrorBackoff {
            current: std::time::Duration::from_secs(1),
            cap: std::time::Duration::from_secs(60),
        }
    }

    /// Advance and return the next backoff duration, doubling up to `cap`.
    pub fn next(&mut self) -> std::time::Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(self.cap);
        wait
    }

    pub fn reset(&mut self) {
        self.current = std::time::Duration::from_secs(1);
    }
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A segment released locally; not re-claimed until `until` passes
/// (Design Notes "release hold-down").
pub struct HoldDown {
    pub until: Instant,
}
