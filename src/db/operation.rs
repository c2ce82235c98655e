//! The deferred operations a worker executes.
//!
//! One tagged enum instead of a class hierarchy: the worker loop matches on
//! the variant for routing hints, SQL generation, and execution. All
//! variants hold their promise weakly so an abandoned consumer never pins
//! queued work.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::error::Error;
use crate::promise::Promise;

use super::driver::DbConnection;
use super::object::DbObject;

/// Callback invoked once per fetched row of a batch load.
pub type RowCallback = Box<dyn FnMut(&mut dyn DbConnection) -> Result<(), Error> + Send>;

/// Callback handed the raw connection by a low-level access operation.
pub type AccessCallback = Box<dyn FnMut(&mut dyn DbConnection) -> Result<(), Error> + Send>;

/// Shared completion guard for `Wait` operations.
///
/// Every worker's `Wait` entry holds one clone; when the last entry is
/// retired the guard drops and fulfills the aggregate promise, i.e. after
/// *all* workers have drained past their marker.
pub(crate) struct WaitGuard {
    promise: Weak<Promise>,
}

impl WaitGuard {
    pub(crate) fn new(promise: &Arc<Promise>) -> Arc<Self> {
        Arc::new(Self {
            promise: Arc::downgrade(promise),
        })
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if let Some(promise) = self.promise.upgrade() {
            let _ = promise.set_success((), false);
        }
    }
}

/// A queued database operation.
pub(crate) enum Operation {
    /// INSERT or REPLACE of one object.
    Save {
        promise: Weak<Promise>,
        object: Arc<dyn DbObject>,
        replace: bool,
    },
    /// Fill `object` from exactly one row.
    Load {
        promise: Weak<Promise>,
        object: Arc<dyn DbObject>,
        query: String,
    },
    /// Delete rows matched by `query`.
    Delete {
        promise: Weak<Promise>,
        table: String,
        query: String,
    },
    /// Invoke `callback` once per fetched row.
    BatchLoad {
        promise: Weak<Promise>,
        callback: Mutex<RowCallback>,
        table: String,
        query: String,
    },
    /// Hand the raw connection to `callback`.
    LowLevelAccess {
        promise: Weak<Promise>,
        callback: Mutex<AccessCallback>,
        table: String,
        from_replica: bool,
    },
    /// Queue marker; holds its shared guard purely so that retiring the
    /// entry drops one reference.
    Wait { _guard: Arc<WaitGuard> },
}

impl Operation {
    /// Table hint used for routing.
    pub(crate) fn table(&self) -> &str {
        match self {
            Operation::Save { object, .. } | Operation::Load { object, .. } => object.table(),
            Operation::Delete { table, .. }
            | Operation::BatchLoad { table, .. }
            | Operation::LowLevelAccess { table, .. } => table,
            Operation::Wait { .. } => "",
        }
    }

    /// Whether this operation prefers the replica connection.
    pub(crate) fn use_replica(&self) -> bool {
        match self {
            Operation::Load { .. } | Operation::BatchLoad { .. } => true,
            Operation::LowLevelAccess { from_replica, .. } => *from_replica,
            _ => false,
        }
    }

    /// The object whose repeated writes may coalesce; writes only.
    pub(crate) fn combinable(&self) -> Option<&Arc<dyn DbObject>> {
        match self {
            Operation::Save { object, .. } => Some(object),
            _ => None,
        }
    }

    /// Upgrades the attached promise, if a consumer still holds it.
    ///
    /// `Wait` reports no promise here; its guard fulfills the aggregate
    /// promise on retirement instead.
    pub(crate) fn promise(&self) -> Option<Arc<Promise>> {
        match self {
            Operation::Save { promise, .. }
            | Operation::Load { promise, .. }
            | Operation::Delete { promise, .. }
            | Operation::BatchLoad { promise, .. }
            | Operation::LowLevelAccess { promise, .. } => promise.upgrade(),
            Operation::Wait { .. } => None,
        }
    }

    /// Renders the SQL text this operation executes.
    pub(crate) fn generate_sql(&self) -> String {
        match self {
            Operation::Save {
                object, replace, ..
            } => {
                let mut query = String::new();
                query.push_str(if *replace { "REPLACE" } else { "INSERT" });
                query.push_str(" INTO `");
                query.push_str(object.table());
                query.push_str("` SET ");
                object.generate_sql(&mut query);
                query.truncate(query.trim_end_matches([' ', ',']).len());
                query
            }
            Operation::Load { query, .. }
            | Operation::Delete { query, .. }
            | Operation::BatchLoad { query, .. } => query.clone(),
            Operation::LowLevelAccess { .. } => String::new(),
            Operation::Wait { .. } => "DO 0".to_string(),
        }
    }

    /// Executes against `conn`. `query` is the output of
    /// [`Operation::generate_sql`], regenerated for every attempt.
    pub(crate) fn execute(&self, conn: &mut dyn DbConnection, query: &str) -> Result<(), Error> {
        match self {
            Operation::Save { .. } | Operation::Delete { .. } | Operation::Wait { .. } => {
                conn.execute(query)
            }
            Operation::Load {
                promise, object, ..
            } => {
                if promise.strong_count() == 0 {
                    warn!(table = object.table(), query, "Discarding isolated query");
                    return Ok(());
                }
                conn.execute(query)?;
                if !conn.fetch_row()? {
                    return Err(Error::NoData);
                }
                object.fetch(conn)
            }
            Operation::BatchLoad {
                promise,
                callback,
                table,
                ..
            } => {
                if promise.strong_count() == 0 {
                    warn!(table = %table, query, "Discarding isolated query");
                    return Ok(());
                }
                conn.execute(query)?;
                let mut callback = callback.lock().unwrap();
                while conn.fetch_row()? {
                    (*callback)(conn)?;
                }
                debug!(table = %table, "Batch load complete");
                Ok(())
            }
            Operation::LowLevelAccess { callback, .. } => {
                let mut callback = callback.lock().unwrap();
                (*callback)(conn)
            }
        }
    }

    /// Variant name for logging.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Operation::Save { .. } => "save",
            Operation::Load { .. } => "load",
            Operation::Delete { .. } => "delete",
            Operation::BatchLoad { .. } => "batch-load",
            Operation::LowLevelAccess { .. } => "low-level-access",
            Operation::Wait { .. } => "wait",
        }
    }
}
