//! Millisecond clocks used by the daemons.
//!
//! Two kinds of time flow through this crate:
//!
//! - *ticks*: a monotonic millisecond count from an unspecified epoch
//!   (process start), used for due-times and timer deadlines;
//! - *wall-clock milliseconds*: UTC or local milliseconds since
//!   1970-01-01, used only to align hourly/daily/weekly timers and to name
//!   dump files.

use std::sync::OnceLock;
use std::time::Instant;

use chrono::{Local, Utc};

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Monotonic milliseconds since process start.
///
/// Never decreases and never wraps within the lifetime of a process.
pub fn monotonic_ms() -> u64 {
    anchor().elapsed().as_millis() as u64
}

/// Milliseconds since the UTC epoch.
pub fn utc_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Milliseconds since the epoch of the *local* wall clock.
///
/// This is the local clock face read as if it were UTC, so that modular
/// arithmetic against hour/day/week periods lands on local boundaries.
pub fn local_ms() -> u64 {
    Local::now()
        .naive_local()
        .and_utc()
        .timestamp_millis()
        .max(0) as u64
}
