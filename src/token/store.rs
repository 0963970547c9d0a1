//! Token Store consumed interface (spec.md §4.1).

use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::PsepError;
use crate::error::Result;
use crate::token::tracking_token::TrackingToken;

/// A lease on a segment, recorded in the Token Store and periodically
/// extended (spec.md §3 "Claim").
#[derive(Debug, Clone)]
pub struct Claim {
    pub processor_name: String,
    pub segment_id: u64,
    pub owner_id: String,
    pub last_updated: Instant,
}

impl Claim {
    /// A claim is valid iff it was refreshed within `claim_timeout`.
    pub fn is_valid(&self, now: Instant, claim_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_updated) < claim_timeout
    }
}

/// Durable, per-segment CAS-guarded claim and progress store
/// (spec.md §4.1). All operations are atomic with respect to concurrent
/// callers across the fleet.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Idempotent at whole-store level: fails with
    /// [`PsepError::ConfigurationError`]-classified error if any segment
    /// already exists for `processor`.
    async fn initialize_token_segments(
        &self,
        processor: &str,
        count: u32,
        initial_token: TrackingToken,
    ) -> Result<()>;

    /// Sorted segment ids known to the store for `processor`.
    async fn fetch_segments(&self, processor: &str) -> Result<Vec<u64>>;

    /// Fetch the current token for `segment_id`, atomically claiming the
    /// segment for `owner_id`. Fails with [`PsepError::ClaimLost`] if
    /// another valid claim exists.
    async fn fetch_token(
        &self,
        processor: &str,
        segment_id: u64,
        owner_id: &str,
    ) -> Result<TrackingToken>;

    /// Refresh `last_updated` for a claim this owner already holds. Fails if
    /// the caller no longer owns the claim.
    async fn extend_claim(&self, processor: &str, segment_id: u64, owner_id: &str) -> Result<()>;

    /// Atomic CAS on ownership: persist `token` as the new progress marker.
    /// Fails if `owner_id` is not the current owner.
    async fn store_token(
        &self,
        processor: &str,
        segment_id: u64,
        owner_id: &str,
        token: TrackingToken,
    ) -> Result<()>;

    /// Best-effort unclaim; must never block other operations and must
    /// never fail in a way that blocks the caller's shutdown path.
    async fn release_claim(&self, processor: &str, segment_id: u64, owner_id: &str);

    /// When `true`, this store supports writing new segment rows, which is
    /// required for `splitSegment`/`mergeSegment` (spec.md §4.6).
    fn requires_explicit_segment_initialization(&self) -> bool;

    /// Stable identifier used to key in-process caches, if the store has
    /// one.
    fn retrieve_storage_identifier(&self) -> Option<String>;

    /// Initialize a single additional segment row seeded with `token`
    /// (spec.md §4.6 `splitSegment`). Only called when
    /// `requires_explicit_segment_initialization()` is `true`.
    async fn initialize_segment(
        &self,
        processor: &str,
        segment_id: u64,
        token: TrackingToken,
    ) -> Result<()> {
        let _ = (processor, segment_id, token);
        Err(PsepError::unsupported("initializeSegment"))
    }

    /// Remove a segment row entirely (spec.md §4.6 `mergeSegment`). Only
    /// called when `requires_explicit_segment_initialization()` is `true`.
    async fn delete_segment(&self, processor: &str, segment_id: u64) -> Result<()> {
        let _ = (processor, segment_id);
        Err(PsepError::unsupported("deleteSegment"))
    }
}
