//! Heap-ordered timer scheduling.
//!
//! The [`TimerDaemon`] owns a background thread and a min-heap of pending
//! firings. Registering a timer returns an [`Arc<Timer>`]; the scheduler
//! keeps only weak references, so dropping the last strong handle silently
//! retires the timer.
//!
//! Ordinary timers fire as [`TimerJob`]s produced onto the external job
//! dispatcher. *Low-level* timers run their callback inline on the
//! scheduler thread and must therefore be quick and must never block.

mod daemon;

pub use daemon::{TimerDaemon, TimerJob};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Milliseconds per hour.
pub const MS_PER_HOUR: u64 = 1000 * 3600;
/// Milliseconds per day.
pub const MS_PER_DAY: u64 = MS_PER_HOUR * 24;
/// Milliseconds per week.
pub const MS_PER_WEEK: u64 = MS_PER_DAY * 7;

/// Callback invoked when a timer fires.
///
/// Receives the timer itself, the monotonic tick at which the scheduler
/// observed the firing, and the timer's period (zero for one-shot).
pub type TimerCallback = Box<dyn Fn(&Arc<Timer>, u64, u64) + Send + Sync>;

/// A registered timer.
///
/// Lives as long as any strong reference. The period and the generation
/// stamp are atomic so a re-arm from one thread is visible to the scheduler
/// without extra locking; heap entries snapshot the stamp and are discarded
/// when it no longer matches.
pub struct Timer {
    period: AtomicU64,
    stamp: AtomicU64,
    low_level: bool,
    callback: TimerCallback,
}

impl Timer {
    pub(crate) fn new(period: u64, callback: TimerCallback, low_level: bool) -> Self {
        Self {
            period: AtomicU64::new(period),
            stamp: AtomicU64::new(0),
            low_level,
            callback,
        }
    }

    /// Current period in ticks; zero means one-shot.
    pub fn period(&self) -> u64 {
        self.period.load(Ordering::Acquire)
    }

    /// True if the callback runs inline on the scheduler thread.
    pub fn is_low_level(&self) -> bool {
        self.low_level
    }

    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// Applies a new period (`None` keeps the current one) and bumps the
    /// stamp, invalidating every heap entry snapshotted before this call.
    pub(crate) fn re_arm(&self, period: Option<u64>) -> u64 {
        if let Some(period) = period {
            self.period.store(period, Ordering::Release);
        }
        self.stamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn fire(timer: &Arc<Timer>, now: u64, period: u64) {
        (timer.callback)(timer, now, period);
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("period", &self.period())
            .field("stamp", &self.stamp())
            .field("low_level", &self.low_level)
            .finish()
    }
}
