//! Monotonic millisecond timestamps.
//!
//! A thin wrapper so the rest of the crate has one place to swap in a
//! virtual clock for deterministic tests, rather than calling
//! `SystemTime::now()` throughout.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
