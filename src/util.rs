//! Small shared helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds, as stored in keys and item metadata
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
