//! Work Package state machine (spec.md §4.4 "State machine").

use serde::Deserialize;
use serde::Serialize;

/// `Scheduled -> Running -> (Idle | Scheduled)` with terminal `Aborted`.
/// Transitions to `Aborted` are irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkPackageState {
    /// Has events pending (or just created) and will run its batch loop
    /// imminently.
    Scheduled,
    /// Currently draining its queue and invoking the handler.
    Running,
    /// Queue empty, parked awaiting the next scheduled event.
    Idle,
    /// Terminal: claim released (or being released), task exiting.
    Aborted,
}

impl WorkPackageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkPackageState::Aborted)
    }
}
