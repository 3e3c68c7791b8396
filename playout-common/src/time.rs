//! Timestamp utilities
//!
//! Schedule deadlines are wall-clock `DateTime<Utc>` values while durations
//! and prerolls are `std::time::Duration`. These helpers bridge the two
//! without panicking on out-of-range values.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Convert a std duration to a chrono delta, saturating at the chrono maximum
pub fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// `at + duration`, clamped to the latest representable timestamp
pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - duration`, clamped to the earliest representable timestamp
pub fn sub_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(to_delta(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Time left until `deadline`, or `None` once it has been reached
pub fn remaining_until(deadline: DateTime<Utc>, at: DateTime<Utc>) -> Option<Duration> {
    if at >= deadline {
        return None;
    }
    (deadline - at).to_std().ok()
}
