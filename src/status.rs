//! Observable processing status (spec.md §3 "Processing Status", §6
//! "Observable surface").

use crate::token::tracking_token::TrackingToken;

/// Per-segment observable snapshot. Eventually consistent; may lag by one
/// batch (spec.md §5 "Shared resources").
#[derive(Debug, Clone)]
pub struct ProcessingStatus {
    pub current_position: Option<i64>,
    pub tracking_token: Option<TrackingToken>,
    pub is_caught_up: bool,
    pub is_replaying: bool,
    pub is_error_state: bool,
    pub error_count: u32,
}

impl ProcessingStatus {
    pub fn from_token(token: &TrackingToken, is_caught_up: bool, error_count: u32) -> Self {
        ProcessingStatus {
            current_position: token.position(),
            tracking_token: Some(token.clone()),
            is_caught_up,
            is_replaying: token.is_replaying(),
            is_error_state: error_count > 0,
            error_count,
        }
    }
}
