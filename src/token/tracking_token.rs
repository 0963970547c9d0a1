//! Opaque, totally-ordered stream positions (spec.md §3 "Tracking Token").

use serde::Deserialize;
use serde::Serialize;

/// An opaque, comparable position in the upstream stream.
///
/// `GlobalSequence` is the only concrete position representation this crate
/// ships; message sources that track position differently can still satisfy
/// the `covers`/`position` contract by mapping onto it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingToken {
    /// A concrete, ordered position.
    Global(GlobalSequence),
    /// A region being replayed: events before `reset_position` are
    /// re-delivered even though the segment has previously advanced past
    /// them (spec.md §3 "Replay Token").
    Replay(ReplayToken),
}

/// A single monotonically ordered position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalSequence(pub i64);

/// Wraps a `(start_position, reset_position)` pair: events with position
/// less than `reset_position` are being replayed (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayToken {
    pub start_position: GlobalSequence,
    pub reset_position: GlobalSequence,
}

impl TrackingToken {
    /// Construct a token at a concrete position.
    pub fn at(position: i64) -> Self {
        TrackingToken::Global(GlobalSequence(position))
    }

    /// Wrap `token` as a replay of everything below `reset_position`.
    pub fn replaying(token: TrackingToken, reset_position: i64) -> Self {
        let start_position = token.position().map(GlobalSequence).unwrap_or(GlobalSequence(-1));
        TrackingToken::Replay(ReplayToken {
            start_position,
            reset_position: GlobalSequence(reset_position),
        })
    }

    /// The concrete position this token refers to, if any.
    pub fn position(&self) -> Option<i64> {
        match self {
            TrackingToken::Global(seq) => Some(seq.0),
            TrackingToken::Replay(replay) => Some(replay.start_position.0),
        }
    }

    /// `true` iff `self` has processed at least everything `other` has.
    pub fn covers(&self, other: &TrackingToken) -> bool {
        match (self.position(), other.position()) {
            (Some(a), Some(b)) => a >= b,
            (None, None) => true,
            (Some(_), None) => true,
            (None, Some(_)) => false,
        }
    }

    /// `true` iff this token is a [`ReplayToken`] that has not yet caught up
    /// to its own `reset_position` (spec.md §9 "Replay detection").
    pub fn is_replaying(&self) -> bool {
        match self {
            TrackingToken::Replay(replay) => replay.start_position < replay.reset_position,
            TrackingToken::Global(_) => false,
        }
    }

    /// Advance a `Global` token to `position`; replay tokens advance their
    /// `start_position` while keeping `reset_position` fixed, so
    /// `is_replaying` naturally flips to `false` once caught up.
    pub fn advanced_to(&self, position: i64) -> TrackingToken {
        match self {
            TrackingToken::Global(_) => TrackingToken::Global(GlobalSequence(position)),
            TrackingToken::Replay(replay) => {
                let mut replay = replay.clone();
                replay.start_position = GlobalSequence(position);
                TrackingToken::Replay(replay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_compares_positions() {
        let a = TrackingToken::at(10);
        let b = TrackingToken::at(5);
        assert!(a.covers(&b));
        assert!(!b.covers(&a));
    }

    #[test]
    fn replay_token_is_replaying_until_caught_up() {
        let base = TrackingToken::at(3);
        let replay = TrackingToken::replaying(base, 100);
        assert!(replay.is_replaying());

        let caught_up = replay.advanced_to(100);
        assert!(!caught_up.is_replaying());
    }

    #[test]
    fn advancing_preserves_replay_wrapper() {
        let base = TrackingToken::at(0);
        let replay = TrackingToken::replaying(base, 50);
        let advanced = replay.advanced_to(10);
        match advanced {
            TrackingToken::Replay(r) => {
                assert_eq!(r.start_position, GlobalSequence(10));
                assert_eq!(r.reset_position, GlobalSequence(50));
            }
            _ => panic!("expected replay token"),
        }
    }
}
