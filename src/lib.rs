//! Capstan - background work-dispatch daemons for long-lived server processes.
//!
//! This library hosts a family of single-producer/multi-consumer daemons that
//! accept deferred operations, route them to worker threads, coalesce and
//! retry them, and deliver results through a promise abstraction:
//!
//! - [`timer`] - a heap-ordered scheduler driving periodic and one-shot
//!   callbacks, either inline or as jobs for an external dispatcher
//! - [`dns`] - serialized blocking host lookups fulfilling promises
//! - [`modules`] - shared-library loading with priority-ordered initializers
//! - [`db`] - a per-table sharded worker pool with write coalescing,
//!   bounded retries, and a disk spill for queries that exhaust them
//! - [`promise`] - the cross-thread single-shot result cell binding
//!   producers and consumers together
//!
//! # High-Level API
//!
//! Each daemon is an explicit service object with a `new() / start() / stop()`
//! lifecycle, passed around by `Arc`:
//!
//! ```ignore
//! use capstan::config::{ConfigMap, DbSettings};
//! use capstan::db::DbDaemon;
//!
//! let settings = DbSettings::from_config(&config);
//! let daemon = DbDaemon::new(settings, factory);
//! daemon.start()?;
//!
//! let promise = daemon.enqueue_for_saving(record, true, false)?;
//! promise.wait(std::time::Duration::from_secs(5));
//! ```

pub mod arith;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod logging;
pub mod modules;
pub mod promise;
pub mod timer;

pub use error::Error;
pub use promise::Promise;

/// Version of the capstan library.
///
/// Synchronized with `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
