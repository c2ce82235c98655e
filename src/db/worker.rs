//! One database worker thread and its FIFO queue.
//!
//! The worker owns two lazily-established connections (primary and
//! replica) and pumps its queue head: coalescing check, SQL generation,
//! execution, then retry bookkeeping or promise fulfillment. The entry
//! stays at the queue head for the whole attempt and is popped only once
//! committed, dumped, or skipped, so the queue length always counts
//! unfinished work - `wait_till_idle` depends on that.
//!
//! Only the worker thread pops its queue; producers push at the back under
//! the same mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::arith::saturated_add;
use crate::clock::monotonic_ms;
use crate::config::DbSettings;
use crate::error::Error;

use super::driver::{ConnectionFactory, DbConnection, DbEndpoint};
use super::dump::SqlDump;
use super::object::DbObject;
use super::operation::Operation;

/// Upper bound of the adaptive idle backoff, in milliseconds.
const MAX_IDLE_BACKOFF_MS: u64 = 128;

/// Polling interval of [`DbWorker::wait_till_idle`].
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Generation serial for queue entries; never zero, never reused.
fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Everything a worker shares with its daemon.
pub(crate) struct WorkerContext {
    pub(crate) settings: DbSettings,
    pub(crate) factory: Arc<dyn ConnectionFactory>,
    pub(crate) dump: Arc<SqlDump>,
    pub(crate) primary: DbEndpoint,
    pub(crate) replica: Option<DbEndpoint>,
}

impl WorkerContext {
    pub(crate) fn new(settings: DbSettings, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let dump = Arc::new(SqlDump::new(&settings.dump_dir));
        let primary = DbEndpoint::primary(&settings);
        let replica = DbEndpoint::replica(&settings);
        Arc::new(Self {
            settings,
            factory,
            dump,
            primary,
            replica,
        })
    }
}

struct QueueEntry {
    operation: Arc<Operation>,
    // Keeps the route pinned while this entry is in flight.
    _probe: Option<Arc<()>>,
    due_time: u64,
    retry_count: usize,
    serial: u64,
}

/// A worker thread with a private FIFO queue.
pub(crate) struct DbWorker {
    index: usize,
    running: AtomicBool,
    // Ignore due-times and drain everything; auto-clears once empty.
    urgent: AtomicBool,
    queue: Mutex<VecDeque<QueueEntry>>,
    new_operation: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    ctx: Arc<WorkerContext>,
}

impl DbWorker {
    pub(crate) fn new(index: usize, ctx: Arc<WorkerContext>) -> Arc<Self> {
        Arc::new(Self {
            index,
            running: AtomicBool::new(false),
            urgent: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            new_operation: Condvar::new(),
            thread: Mutex::new(None),
            ctx,
        })
    }

    /// Spawns the worker thread.
    pub(crate) fn start(worker: &Arc<DbWorker>) {
        worker.running.store(true, Ordering::Release);
        let thread_worker = Arc::clone(worker);
        let handle = thread::Builder::new()
            .name(format!("db-worker-{}", worker.index))
            .spawn(move || thread_worker.run_loop())
            .expect("failed to spawn database worker thread");
        *worker.thread.lock().unwrap() = Some(handle);
    }

    /// Clears the running flag; the thread exits once its queue drains.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.new_operation.notify_all();
    }

    /// Drains the queue, then joins the thread.
    pub(crate) fn safe_join(&self) {
        self.wait_till_idle();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.join() {
                warn!(index = self.index, "Database worker thread panicked: {:?}", err);
            }
        }
    }

    /// Forces the urgent flag and polls until the queue is empty and
    /// nothing is mid-execute.
    pub(crate) fn wait_till_idle(&self) {
        loop {
            let (pending, current_sql) = {
                let queue = self.queue.lock().unwrap();
                let Some(head) = queue.front() else {
                    break;
                };
                self.urgent.store(true, Ordering::Release);
                (queue.len(), head.operation.generate_sql())
            };
            self.new_operation.notify_one();
            info!(
                index = self.index,
                pending,
                current_sql = %current_sql,
                "Waiting for queued operations to complete"
            );
            thread::sleep(IDLE_POLL_INTERVAL);
        }
    }

    /// Queue length, counting the entry currently executing.
    pub(crate) fn queue_size(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Appends an operation.
    ///
    /// Every entry gets `due_time = now + save_delay`; urgency is a
    /// queue-wide override applied by the pump, not a per-entry property.
    /// A `Save` stores its serial into the object's write stamp: the
    /// newest queued write owns the stamp.
    pub(crate) fn add_operation(
        &self,
        operation: Arc<Operation>,
        probe: Option<Arc<()>>,
        urgent: bool,
    ) -> Result<(), Error> {
        let due_time = saturated_add(monotonic_ms(), self.ctx.settings.save_delay);
        {
            let mut queue = self.queue.lock().unwrap();
            if !self.running.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            let serial = next_serial();
            if let Some(object) = operation.combinable() {
                object.write_stamp().store(serial);
            }
            queue.push_back(QueueEntry {
                operation,
                _probe: probe,
                due_time,
                retry_count: 0,
                serial,
            });
            if urgent {
                self.urgent.store(true, Ordering::Release);
            }
        }
        self.new_operation.notify_one();
        Ok(())
    }

    /// Executes the head entry if it is due. Returns whether it made
    /// progress.
    fn pump_one_operation(
        &self,
        primary: &mut Option<Box<dyn DbConnection>>,
        replica: &mut Option<Box<dyn DbConnection>>,
    ) -> bool {
        let now = monotonic_ms();
        let (operation, serial, retry_count) = {
            let mut queue = self.queue.lock().unwrap();
            let Some(head) = queue.front() else {
                self.urgent.store(false, Ordering::Release);
                return false;
            };
            if !self.urgent.load(Ordering::Acquire) && now < head.due_time {
                return false;
            }
            (Arc::clone(&head.operation), head.serial, head.retry_count)
        };

        // Coalescing: the stamp names the newest queued write for the
        // object. Ours means we are the latest; zero means a fresh save
        // already ran; anything else means a later write supersedes us.
        let mut execute_it = true;
        if let Some(object) = operation.combinable() {
            let stamp = object.write_stamp().load();
            if stamp == serial {
                object.write_stamp().clear();
            } else if stamp != 0 {
                debug!(table = operation.table(), "Skipping superseded write");
                execute_it = false;
            }
        }

        let query = operation.generate_sql();
        let used_replica = operation.use_replica() && replica.is_some();
        let mut failure = None;
        if execute_it {
            let conn = if used_replica {
                replica.as_mut()
            } else {
                primary.as_mut()
            };
            let Some(conn) = conn else {
                // Connections are ensured by the caller before pumping.
                return false;
            };
            debug!(
                kind = operation.kind(),
                table = operation.table(),
                query = %query,
                "Executing SQL"
            );
            if let Err(err) = operation.execute(conn.as_mut(), &query) {
                warn!(error = %err, "Database operation failed");
                failure = Some(err);
            }
            conn.discard_result();
        }

        if let Some(err) = failure {
            if err.is_retriable() {
                let retries = retry_count + 1;
                if retries < self.ctx.settings.max_retry_count {
                    info!(retry_count = retries, "Going to retry database operation");
                    let delay = self
                        .ctx
                        .settings
                        .retry_init_delay
                        .checked_shl(retries as u32)
                        .unwrap_or(u64::MAX);
                    {
                        let mut queue = self.queue.lock().unwrap();
                        if let Some(head) = queue.front_mut() {
                            head.retry_count = retries;
                            head.due_time = saturated_add(now, delay);
                        }
                    }
                    // Force a reconnect before the next attempt.
                    if used_replica {
                        *replica = None;
                    } else {
                        *primary = None;
                    }
                    return true;
                }
                error!("Max retry count exceeded");
                self.ctx
                    .dump
                    .append(&query, err.code().unwrap_or(0), &err.to_string());
            }
            if let Some(promise) = operation.promise() {
                let _ = promise.set_error(err, false);
            }
        } else if let Some(promise) = operation.promise() {
            let _ = promise.set_success((), false);
        }

        self.queue.lock().unwrap().pop_front();
        true
    }

    /// Establishes missing connections, sleeping `reconnect_delay`
    /// between attempts. Retries indefinitely.
    fn ensure_connections(
        &self,
        primary: &mut Option<Box<dyn DbConnection>>,
        replica: &mut Option<Box<dyn DbConnection>>,
    ) {
        let delay = Duration::from_millis(self.ctx.settings.reconnect_delay);
        while primary.is_none() {
            info!("Connecting to primary database server...");
            match self.ctx.factory.connect(&self.ctx.primary) {
                Ok(conn) => {
                    info!("Successfully connected to primary database server");
                    *primary = Some(conn);
                }
                Err(err) => {
                    error!(error = %err, "Failed to connect to primary database server");
                    thread::sleep(delay);
                }
            }
        }
        if let Some(endpoint) = &self.ctx.replica {
            while replica.is_none() {
                info!("Connecting to replica database server...");
                match self.ctx.factory.connect(endpoint) {
                    Ok(conn) => {
                        info!("Successfully connected to replica database server");
                        *replica = Some(conn);
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to connect to replica database server");
                        thread::sleep(delay);
                    }
                }
            }
        }
    }

    fn run_loop(self: Arc<Self>) {
        info!(index = self.index, "Database worker started");

        let mut primary: Option<Box<dyn DbConnection>> = None;
        let mut replica: Option<Box<dyn DbConnection>> = None;
        let mut timeout: u64 = 0;
        loop {
            loop {
                self.ensure_connections(&mut primary, &mut replica);
                let busy = self.pump_one_operation(&mut primary, &mut replica);
                let cap = if busy { 0 } else { MAX_IDLE_BACKOFF_MS };
                timeout = (timeout * 2 + 1).min(cap);
                if !busy {
                    break;
                }
            }

            let guard = self.queue.lock().unwrap();
            if guard.is_empty() && !self.running.load(Ordering::Acquire) {
                break;
            }
            let _ = self
                .new_operation
                .wait_timeout(guard, Duration::from_millis(timeout))
                .unwrap();
        }

        info!(index = self.index, "Database worker stopped");
    }
}
