//! Node-local clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the epoch. Transaction timestamps and deviation
/// estimates are expressed on this clock.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(i64::MAX as u128) as i64
}
