//! The timer scheduler daemon.
//!
//! One background thread, a mutex-protected min-heap of pending firings,
//! and a condition variable signalled on insert and shutdown. Entries hold
//! weak timer references plus a stamp snapshot; an entry whose timer died
//! or was re-armed since it was pushed is discarded at pop time, so
//! re-arming never has to hunt down stale entries inside the heap.

use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::{Timer, TimerCallback, MS_PER_DAY, MS_PER_HOUR, MS_PER_WEEK};
use crate::arith::{saturated_add, saturated_sub};
use crate::clock::{local_ms, monotonic_ms, utc_ms};
use crate::dispatch::{Job, JobDispatcher};

/// Upper bound of the adaptive idle backoff, in milliseconds.
const MAX_IDLE_BACKOFF_MS: u64 = 128;

struct QueueEntry {
    timer: Weak<Timer>,
    next: u64,
    stamp: u64,
}

// BinaryHeap is a max-heap; inverting the comparison on `next` turns it
// into the min-heap the scheduler needs.
impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.next == other.next
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.next.cmp(&self.next)
    }
}

/// Job produced for an ordinary (non-low-level) timer firing.
///
/// Holds only a weak reference; if every strong handle to the timer is gone
/// by the time the dispatcher runs the job, it does nothing.
pub struct TimerJob {
    timer: Weak<Timer>,
    now: u64,
    period: u64,
}

impl Job for TimerJob {
    fn name(&self) -> &str {
        "timer"
    }

    fn perform(self: Box<Self>) {
        if let Some(timer) = self.timer.upgrade() {
            Timer::fire(&timer, self.now, self.period);
        }
    }
}

/// State shared between the daemon facade and its scheduler thread.
struct TimerCore {
    running: AtomicBool,
    heap: Mutex<BinaryHeap<QueueEntry>>,
    new_timer: Condvar,
    dispatcher: Arc<dyn JobDispatcher>,
}

impl TimerCore {
    fn insert_entry(&self, timer: &Arc<Timer>, next: u64) {
        let mut heap = self.heap.lock().unwrap();
        heap.push(QueueEntry {
            timer: Arc::downgrade(timer),
            next,
            stamp: timer.stamp(),
        });
        drop(heap);
        self.new_timer.notify_one();
    }

    /// Fires the earliest due entry, if any. Returns whether one fired.
    fn pump_one_entry(&self) -> bool {
        let now = monotonic_ms();

        let (timer, period) = {
            let mut heap = self.heap.lock().unwrap();
            loop {
                match heap.peek() {
                    None => return false,
                    Some(top) if now < top.next => return false,
                    Some(_) => {}
                }
                let Some(entry) = heap.pop() else {
                    return false;
                };
                let Some(timer) = entry.timer.upgrade() else {
                    continue;
                };
                if timer.stamp() != entry.stamp {
                    continue;
                }
                let period = timer.period();
                if period > 0 {
                    heap.push(QueueEntry {
                        timer: entry.timer.clone(),
                        next: saturated_add(entry.next, period),
                        stamp: entry.stamp,
                    });
                }
                break (timer, period);
            }
        };

        if timer.is_low_level() {
            trace!("Dispatching low level timer");
            let result = catch_unwind(AssertUnwindSafe(|| Timer::fire(&timer, now, period)));
            if result.is_err() {
                warn!("Panic in low level timer callback");
            }
        } else {
            trace!("Preparing a timer job for dispatching");
            let job = TimerJob {
                timer: Arc::downgrade(&timer),
                now,
                period,
            };
            if let Err(err) = self.dispatcher.enqueue(Box::new(job)) {
                warn!(error = %err, "Failed to enqueue timer job");
            }
        }
        true
    }

    fn run_loop(&self) {
        info!("Timer daemon started");

        let mut timeout: u64 = 0;
        loop {
            loop {
                let busy = self.pump_one_entry();
                let cap = if busy { 0 } else { MAX_IDLE_BACKOFF_MS };
                timeout = (timeout * 2 + 1).min(cap);
                if !busy {
                    break;
                }
            }

            let guard = self.heap.lock().unwrap();
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            let _ = self
                .new_timer
                .wait_timeout(guard, Duration::from_millis(timeout))
                .unwrap();
        }

        info!("Timer daemon stopped");
    }
}

/// The timer scheduler.
///
/// Register calls may be made before `start()`; entries accumulate in the
/// heap and fire once the thread is running.
pub struct TimerDaemon {
    core: Arc<TimerCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerDaemon {
    /// Creates a stopped daemon producing jobs onto `dispatcher`.
    pub fn new(dispatcher: Arc<dyn JobDispatcher>) -> Self {
        Self {
            core: Arc::new(TimerCore {
                running: AtomicBool::new(false),
                heap: Mutex::new(BinaryHeap::new()),
                new_timer: Condvar::new(),
                dispatcher,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the scheduler thread. Idempotent.
    pub fn start(&self) {
        if self.core.running.swap(true, Ordering::AcqRel) {
            warn!("Timer daemon is already running");
            return;
        }
        info!("Starting timer daemon...");

        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || core.run_loop())
            .expect("failed to spawn timer daemon thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Stops the scheduler: joins the thread and clears the heap.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.core.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping timer daemon...");

        self.core.new_timer.notify_all();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.join() {
                warn!("Timer daemon thread panicked: {:?}", err);
            }
        }
        self.core.heap.lock().unwrap().clear();
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers a timer firing first at absolute tick `first`, then every
    /// `period` ticks (zero for one-shot).
    pub fn register_absolute_timer(
        &self,
        first: u64,
        period: u64,
        callback: TimerCallback,
    ) -> Arc<Timer> {
        let timer = Arc::new(Timer::new(period, callback, false));
        self.core.insert_entry(&timer, first);
        debug!(
            fires_in_ms = saturated_sub(first, monotonic_ms()),
            period_ms = timer.period(),
            "Created a timer"
        );
        timer
    }

    /// Registers a timer firing first `delta_first` ticks from now.
    pub fn register_timer(
        &self,
        delta_first: u64,
        period: u64,
        callback: TimerCallback,
    ) -> Arc<Timer> {
        self.register_absolute_timer(saturated_add(monotonic_ms(), delta_first), period, callback)
    }

    /// Registers a low-level timer firing at absolute tick `first`.
    ///
    /// The callback runs inline on the scheduler thread, bypassing the job
    /// dispatcher; it must be quick and must never block.
    pub fn register_low_level_absolute_timer(
        &self,
        first: u64,
        period: u64,
        callback: TimerCallback,
    ) -> Arc<Timer> {
        let timer = Arc::new(Timer::new(period, callback, true));
        self.core.insert_entry(&timer, first);
        debug!(
            fires_in_ms = saturated_sub(first, monotonic_ms()),
            period_ms = timer.period(),
            "Created a low level timer"
        );
        timer
    }

    /// Registers a low-level timer firing `delta_first` ticks from now.
    pub fn register_low_level_timer(
        &self,
        delta_first: u64,
        period: u64,
        callback: TimerCallback,
    ) -> Arc<Timer> {
        self.register_low_level_absolute_timer(
            saturated_add(monotonic_ms(), delta_first),
            period,
            callback,
        )
    }

    /// Registers a timer firing at `minute:second` past every hour, in UTC
    /// or local wall-clock time.
    pub fn register_hourly_timer(
        &self,
        minute: u32,
        second: u32,
        callback: TimerCallback,
        utc: bool,
    ) -> Arc<Timer> {
        let virt_now = if utc { utc_ms() } else { local_ms() };
        let offset = (minute as u64 * 60 + second as u64) * 1000;
        self.register_timer(align_delta(virt_now, offset, MS_PER_HOUR), MS_PER_HOUR, callback)
    }

    /// Registers a timer firing at `hour:minute:second` every day.
    pub fn register_daily_timer(
        &self,
        hour: u32,
        minute: u32,
        second: u32,
        callback: TimerCallback,
        utc: bool,
    ) -> Arc<Timer> {
        let virt_now = if utc { utc_ms() } else { local_ms() };
        let offset = (hour as u64 * 3600 + minute as u64 * 60 + second as u64) * 1000;
        self.register_timer(align_delta(virt_now, offset, MS_PER_DAY), MS_PER_DAY, callback)
    }

    /// Registers a timer firing at `hour:minute:second` on `day_of_week`
    /// (0 = Sunday) every week.
    pub fn register_weekly_timer(
        &self,
        day_of_week: u32,
        hour: u32,
        minute: u32,
        second: u32,
        callback: TimerCallback,
        utc: bool,
    ) -> Arc<Timer> {
        // 1970-01-01 was a Thursday, so Sunday sits three days into the
        // epoch week.
        let virt_now = if utc { utc_ms() } else { local_ms() };
        let offset = ((day_of_week as u64 + 3) * 86400
            + hour as u64 * 3600
            + minute as u64 * 60
            + second as u64)
            * 1000;
        self.register_timer(align_delta(virt_now, offset, MS_PER_WEEK), MS_PER_WEEK, callback)
    }

    // ------------------------------------------------------------------
    // Re-arming
    // ------------------------------------------------------------------

    /// Re-arms `timer` to fire at absolute tick `first`.
    ///
    /// `period` of `None` keeps the current period. Existing heap entries
    /// are invalidated by the stamp bump and discarded when they surface.
    pub fn set_absolute_time(&self, timer: &Arc<Timer>, first: u64, period: Option<u64>) {
        let mut heap = self.core.heap.lock().unwrap();
        let stamp = timer.re_arm(period);
        heap.push(QueueEntry {
            timer: Arc::downgrade(timer),
            next: first,
            stamp,
        });
        drop(heap);
        self.core.new_timer.notify_one();
    }

    /// Re-arms `timer` to fire `delta_first` ticks from now.
    pub fn set_time(&self, timer: &Arc<Timer>, delta_first: u64, period: Option<u64>) {
        self.set_absolute_time(timer, saturated_add(monotonic_ms(), delta_first), period);
    }
}

/// Ticks from `virt_now` to the next wall-clock instant that is `offset`
/// past a `period` boundary.
///
/// Landing exactly on the target yields a full period, never zero.
fn align_delta(virt_now: u64, offset: u64, period: u64) -> u64 {
    let phase = virt_now % period;
    let offset = offset % period;
    if phase < offset {
        offset - phase
    } else {
        period - phase + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Dispatcher that performs jobs inline and counts them.
    struct InlineDispatcher {
        enqueued: AtomicUsize,
    }

    impl InlineDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                enqueued: AtomicUsize::new(0),
            })
        }
        fn count(&self) -> usize {
            self.enqueued.load(Ordering::SeqCst)
        }
    }

    impl JobDispatcher for InlineDispatcher {
        fn enqueue(&self, job: Box<dyn Job>) -> Result<(), Error> {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            job.perform();
            Ok(())
        }
    }

    fn started_daemon(dispatcher: Arc<InlineDispatcher>) -> TimerDaemon {
        let daemon = TimerDaemon::new(dispatcher);
        daemon.start();
        daemon
    }

    #[test]
    fn test_align_delta_next_hour_boundary() {
        // Five hours and ten seconds in: next :00:00 is 3590s away.
        let virt_now = 5 * MS_PER_HOUR + 10_000;
        assert_eq!(align_delta(virt_now, 0, MS_PER_HOUR), MS_PER_HOUR - 10_000);
    }

    #[test]
    fn test_align_delta_offset_already_passed() {
        // 30 minutes in, aiming for :15:00 -> next one is 45 minutes away.
        let virt_now = 30 * 60_000;
        let offset = 15 * 60_000;
        assert_eq!(align_delta(virt_now, offset, MS_PER_HOUR), 45 * 60_000);
    }

    #[test]
    fn test_align_delta_offset_ahead() {
        // 10 minutes in, aiming for :15:00 -> five minutes away.
        let virt_now = 10 * 60_000;
        let offset = 15 * 60_000;
        assert_eq!(align_delta(virt_now, offset, MS_PER_HOUR), 5 * 60_000);
    }

    #[test]
    fn test_align_delta_on_the_boundary_waits_a_full_period() {
        // Exactly :15:00 -> the next one, not this instant.
        let virt_now = 2 * MS_PER_HOUR + 15 * 60_000;
        let offset = 15 * 60_000;
        assert_eq!(align_delta(virt_now, offset, MS_PER_HOUR), MS_PER_HOUR);
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let dispatcher = InlineDispatcher::new();
        let daemon = started_daemon(Arc::clone(&dispatcher));

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = Arc::clone(&hits);
        let _timer = daemon.register_timer(
            10,
            0,
            Box::new(move |_, _, _| {
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(400));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.count(), 1);
        daemon.stop();
    }

    #[test]
    fn test_periodic_timer_fires_repeatedly_and_monotonically() {
        let dispatcher = InlineDispatcher::new();
        let daemon = started_daemon(Arc::clone(&dispatcher));

        let nows = Arc::new(StdMutex::new(Vec::new()));
        let nows_in_cb = Arc::clone(&nows);
        let _timer = daemon.register_low_level_timer(
            0,
            25,
            Box::new(move |_, now, period| {
                assert_eq!(period, 25);
                nows_in_cb.lock().unwrap().push(now);
            }),
        );

        thread::sleep(Duration::from_millis(500));
        daemon.stop();

        let nows = nows.lock().unwrap();
        assert!(nows.len() >= 3, "expected several firings, got {}", nows.len());
        // Firings never run ahead of the schedule, so observed ticks are
        // non-decreasing.
        for pair in nows.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        // Low-level timers bypass the dispatcher entirely.
        assert_eq!(dispatcher.count(), 0);
    }

    #[test]
    fn test_dropping_the_timer_retires_it() {
        let dispatcher = InlineDispatcher::new();
        let daemon = started_daemon(Arc::clone(&dispatcher));

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = Arc::clone(&hits);
        let timer = daemon.register_low_level_timer(
            10,
            10,
            Box::new(move |_, _, _| {
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(100));
        drop(timer);
        thread::sleep(Duration::from_millis(50));
        let after_drop = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), after_drop);
        daemon.stop();
    }

    #[test]
    fn test_re_arm_invalidates_queued_entries() {
        let dispatcher = InlineDispatcher::new();
        let daemon = started_daemon(Arc::clone(&dispatcher));

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = Arc::clone(&hits);
        let timer = daemon.register_low_level_timer(
            5,
            5,
            Box::new(move |_, _, _| {
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(100));
        assert!(hits.load(Ordering::SeqCst) > 0);

        // Push the next firing far into the future; the stale periodic
        // entry must not keep firing.
        daemon.set_time(&timer, 60_000, Some(0));
        thread::sleep(Duration::from_millis(30));
        let after_rearm = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), after_rearm);
        daemon.stop();
    }

    #[test]
    fn test_absolute_time_in_the_past_fires_immediately() {
        let dispatcher = InlineDispatcher::new();
        let daemon = started_daemon(Arc::clone(&dispatcher));

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = Arc::clone(&hits);
        let _timer = daemon.register_low_level_absolute_timer(
            0, // long past
            0,
            Box::new(move |_, _, _| {
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(300));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        daemon.stop();
    }

    #[test]
    fn test_panicking_low_level_callback_does_not_kill_the_thread() {
        let dispatcher = InlineDispatcher::new();
        let daemon = started_daemon(Arc::clone(&dispatcher));

        let _bad = daemon.register_low_level_timer(
            5,
            0,
            Box::new(|_, _, _| panic!("callback failure")),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = Arc::clone(&hits);
        let _good = daemon.register_low_level_timer(
            50,
            0,
            Box::new(move |_, _, _| {
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(400));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        daemon.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_prevents_further_firings() {
        let dispatcher = InlineDispatcher::new();
        let daemon = started_daemon(Arc::clone(&dispatcher));

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = Arc::clone(&hits);
        let _timer = daemon.register_low_level_timer(
            10,
            10,
            Box::new(move |_, _, _| {
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(80));
        daemon.stop();
        daemon.stop();

        let after_stop = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), after_stop);
    }
}
