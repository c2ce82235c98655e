//! The database query daemon facade.
//!
//! Owns the worker pool and the table router. Routing is *sticky*: a route
//! carries a probe (a small shared token) and every queued entry holds a
//! clone of it, so as long as operations for a table are in flight the
//! probe's reference count stays above one and the route is pinned to its
//! worker. Once the count drops back to one the route may be rebalanced -
//! onto an empty slot if any, else onto the worker with the shortest
//! queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::DbSettings;
use crate::error::Error;
use crate::promise::Promise;

use super::driver::{ConnectionFactory, DbConnection};
use super::object::DbObject;
use super::operation::{AccessCallback, Operation, RowCallback, WaitGuard};
use super::worker::{DbWorker, WorkerContext};

struct Route {
    probe: Arc<()>,
    worker: usize,
}

#[derive(Default)]
struct Router {
    routes: HashMap<String, Route>,
    workers: Vec<Option<Arc<DbWorker>>>,
}

impl Router {
    /// Resolves a worker for `table`, spawning or rebalancing as needed.
    fn pick(&mut self, table: &str, ctx: &Arc<WorkerContext>) -> Result<(Arc<()>, Arc<DbWorker>), Error> {
        if self.workers.is_empty() {
            return Err(Error::NotEnabled);
        }
        if let Some(route) = self.routes.get(table) {
            // In-flight operations still reference the probe; keep
            // same-table traffic serialized on the same worker.
            if Arc::strong_count(&route.probe) > 1 {
                if let Some(worker) = self.workers.get(route.worker).cloned().flatten() {
                    return Ok((Arc::clone(&route.probe), worker));
                }
            }
        }

        let probe = Arc::new(());
        for index in 0..self.workers.len() {
            if self.workers[index].is_none() {
                debug!(index, table, "Creating new database worker");
                let worker = DbWorker::new(index, Arc::clone(ctx));
                DbWorker::start(&worker);
                self.workers[index] = Some(Arc::clone(&worker));
                self.routes.insert(
                    table.to_string(),
                    Route {
                        probe: Arc::clone(&probe),
                        worker: index,
                    },
                );
                return Ok((probe, worker));
            }
        }

        let mut best: Option<(usize, usize, Arc<DbWorker>)> = None;
        for (index, slot) in self.workers.iter().enumerate() {
            if let Some(worker) = slot {
                let size = worker.queue_size();
                debug!(index, queue_size = size, "Database worker queue size");
                if best.as_ref().map_or(true, |(smallest, _, _)| size < *smallest) {
                    best = Some((size, index, Arc::clone(worker)));
                }
            }
        }
        let Some((_, index, worker)) = best else {
            return Err(Error::NotEnabled);
        };
        debug!(index, table, "Picking database worker");
        self.routes.insert(
            table.to_string(),
            Route {
                probe: Arc::clone(&probe),
                worker: index,
            },
        );
        Ok((probe, worker))
    }

    fn live_workers(&self) -> Vec<Arc<DbWorker>> {
        self.workers.iter().flatten().cloned().collect()
    }
}

/// The database query daemon.
///
/// All entry points are non-blocking; results travel through the returned
/// promises. See the module docs for the execution model.
pub struct DbDaemon {
    running: AtomicBool,
    router: Mutex<Router>,
    ctx: Arc<WorkerContext>,
}

impl DbDaemon {
    /// Creates a stopped daemon.
    pub fn new(settings: DbSettings, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            running: AtomicBool::new(false),
            router: Mutex::new(Router::default()),
            ctx: WorkerContext::new(settings, factory),
        }
    }

    /// Starts the daemon.
    ///
    /// Performs preflight checks first: both endpoints must accept a
    /// connection and a no-op query, and the dump directory (when
    /// configured) must be writable. A pool size of zero skips the checks
    /// and leaves the daemon disabled: every enqueue then fails with
    /// [`Error::NotEnabled`]. Idempotent.
    pub fn start(&self) -> Result<(), Error> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Database daemon is already running");
            return Ok(());
        }
        info!("Starting database daemon...");
        if let Err(err) = self.preflight() {
            self.running.store(false, Ordering::Release);
            return Err(err);
        }
        self.router.lock().unwrap().workers = vec![None; self.ctx.settings.max_thread_count];
        info!("Database daemon started");
        Ok(())
    }

    fn preflight(&self) -> Result<(), Error> {
        if self.ctx.settings.max_thread_count == 0 {
            warn!(
                "Database support is disabled; set `db_max_thread_count` to a value \
                 greater than zero to enable it"
            );
            return Ok(());
        }

        info!("Checking whether the primary database server is up...");
        let mut conn = self.ctx.factory.connect(&self.ctx.primary)?;
        conn.execute("DO 0")?;
        if let Some(endpoint) = &self.ctx.replica {
            info!("Checking whether the replica database server is up...");
            let mut conn = self.ctx.factory.connect(endpoint)?;
            conn.execute("DO 0")?;
        }

        if self.ctx.dump.is_enabled() {
            info!("Checking whether the SQL dump directory is writable...");
            self.ctx.dump.probe()?;
        } else {
            warn!("SQL error dump is disabled; set `db_dump_dir` to a directory path to enable it");
        }
        Ok(())
    }

    /// Stops the daemon: clears every worker's running flag, drains and
    /// joins them one by one, then clears the router. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping database daemon...");

        let workers = self.router.lock().unwrap().live_workers();
        for worker in &workers {
            worker.stop();
        }
        for worker in &workers {
            info!("Waiting for database worker to terminate...");
            worker.safe_join();
        }
        info!("Database daemon stopped");

        let mut router = self.router.lock().unwrap();
        router.workers.clear();
        router.routes.clear();
    }

    /// Opens a direct connection outside the worker pool.
    pub fn create_connection(&self, from_replica: bool) -> Result<Box<dyn DbConnection>, Error> {
        let endpoint = if from_replica {
            self.ctx.replica.as_ref().unwrap_or(&self.ctx.primary)
        } else {
            &self.ctx.primary
        };
        self.ctx.factory.connect(endpoint)
    }

    /// Synchronously drains every worker queue.
    pub fn wait_for_all_async_operations(&self) {
        let workers = self.router.lock().unwrap().live_workers();
        for worker in workers {
            worker.wait_till_idle();
        }
    }

    // ------------------------------------------------------------------
    // Enqueue entry points
    // ------------------------------------------------------------------

    /// Queues an INSERT (or REPLACE) of `object`.
    ///
    /// Writes of the same object queued within the save delay coalesce:
    /// only the newest one reaches the server, though every promise still
    /// completes successfully.
    pub fn enqueue_for_saving(
        &self,
        object: Arc<dyn DbObject>,
        to_replace: bool,
        urgent: bool,
    ) -> Result<Arc<Promise>, Error> {
        let promise = Arc::new(Promise::new());
        let table = object.table().to_string();
        let operation = Operation::Save {
            promise: Arc::downgrade(&promise),
            object,
            replace: to_replace,
        };
        self.dispatch_by_table(&table, operation, urgent)?;
        Ok(promise)
    }

    /// Queues a load of exactly one row into `object`.
    ///
    /// The promise fails with [`Error::NoData`] when the query returns no
    /// rows. `query` must not be empty.
    pub fn enqueue_for_loading(
        &self,
        object: Arc<dyn DbObject>,
        query: impl Into<String>,
    ) -> Result<Arc<Promise>, Error> {
        let query = query.into();
        assert!(!query.is_empty());

        let promise = Arc::new(Promise::new());
        let table = object.table().to_string();
        let operation = Operation::Load {
            promise: Arc::downgrade(&promise),
            object,
            query,
        };
        self.dispatch_by_table(&table, operation, true)?;
        Ok(promise)
    }

    /// Queues a delete. `query` must not be empty.
    pub fn enqueue_for_deleting(
        &self,
        table_hint: &str,
        query: impl Into<String>,
    ) -> Result<Arc<Promise>, Error> {
        let query = query.into();
        assert!(!query.is_empty());

        let promise = Arc::new(Promise::new());
        let operation = Operation::Delete {
            promise: Arc::downgrade(&promise),
            table: table_hint.to_string(),
            query,
        };
        self.dispatch_by_table(table_hint, operation, true)?;
        Ok(promise)
    }

    /// Queues a query whose callback is invoked once per fetched row.
    /// `query` must not be empty.
    pub fn enqueue_for_batch_loading(
        &self,
        callback: RowCallback,
        table_hint: &str,
        query: impl Into<String>,
    ) -> Result<Arc<Promise>, Error> {
        let query = query.into();
        assert!(!query.is_empty());

        let promise = Arc::new(Promise::new());
        let operation = Operation::BatchLoad {
            promise: Arc::downgrade(&promise),
            callback: Mutex::new(callback),
            table: table_hint.to_string(),
            query,
        };
        self.dispatch_by_table(table_hint, operation, true)?;
        Ok(promise)
    }

    /// Queues an operation that hands the raw connection to `callback`,
    /// fulfilling the caller-supplied `promise`.
    pub fn enqueue_for_low_level_access(
        &self,
        promise: &Arc<Promise>,
        callback: AccessCallback,
        table_hint: &str,
        from_replica: bool,
    ) -> Result<(), Error> {
        let operation = Operation::LowLevelAccess {
            promise: Arc::downgrade(promise),
            callback: Mutex::new(callback),
            table: table_hint.to_string(),
            from_replica,
        };
        self.dispatch_by_table(table_hint, operation, true)
    }

    /// Queues a completion marker on every live worker.
    ///
    /// The returned promise is fulfilled once *all* workers have drained
    /// past their marker; with no live workers it is fulfilled
    /// immediately.
    pub fn enqueue_for_waiting_for_all_async_operations(&self) -> Result<Arc<Promise>, Error> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let promise = Arc::new(Promise::new());
        let guard = WaitGuard::new(&promise);
        let workers = {
            let router = self.router.lock().unwrap();
            if router.workers.is_empty() {
                return Err(Error::NotEnabled);
            }
            router.live_workers()
        };
        for worker in workers {
            let operation = Operation::Wait {
                _guard: Arc::clone(&guard),
            };
            worker.add_operation(Arc::new(operation), None, true)?;
        }
        Ok(promise)
    }

    fn dispatch_by_table(
        &self,
        table: &str,
        operation: Operation,
        urgent: bool,
    ) -> Result<(), Error> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let (probe, worker) = self.router.lock().unwrap().pick(table, &self.ctx)?;
        worker.add_operation(Arc::new(operation), Some(probe), urgent)
    }
}
