//! Passive health decisions.
//!
//! Rules deciding when an observed request outcome should mark a backend dead.
//! Nothing here holds state: callers pass in what they already know about the
//! failed attempt or the received response, and act on the returned decision by
//! calling the directory's `mark_dead`.
use hyper::{HeaderMap, StatusCode, header::RETRY_AFTER};

use crate::ports::upstream::UpstreamError;

/// Whether a dead mark may be issued for a frontend with `total_candidates`
/// backends. A sole backend is never marked dead.
pub fn can_mark_dead(total_candidates: usize) -> bool {
    total_candidates > 1
}

/// Connection-level failure: refused, timed out or TCP-timeout flagged.
pub fn should_mark_dead_on_error(error: &UpstreamError, total_candidates: usize) -> bool {
    error.is_backend_failure() && can_mark_dead(total_candidates)
}

/// Lowest status code counted as a backend failure.
///
/// 500 is only counted when enabled and no active checker is already covering it.
pub fn error_threshold(dead_backend_on_500: bool, active_health_checks: bool) -> u16 {
    if dead_backend_on_500 && !active_health_checks {
        500
    } else {
        501
    }
}

/// Outcome of inspecting a backend response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusVerdict {
    Healthy,
    /// 503 carrying `Retry-After`: the backend announced maintenance
    Maintenance,
    Failed,
}

/// Classify a response status against `threshold`. Synthesized error pages are
/// never attributed to the backend.
pub fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    threshold: u16,
    synthesized: bool,
) -> StatusVerdict {
    let code = status.as_u16();
    if synthesized || code < threshold || code >= 600 {
        return StatusVerdict::Healthy;
    }
    if status == StatusCode::SERVICE_UNAVAILABLE && headers.contains_key(RETRY_AFTER) {
        return StatusVerdict::Maintenance;
    }
    StatusVerdict::Failed
}
