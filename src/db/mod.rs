//! The database query daemon.
//!
//! A fixed-size pool of worker threads, each owning a private FIFO queue.
//! A router maps table hints to workers lazily, with load balancing, and
//! keeps same-table traffic *sticky* to one worker so that writes stay in
//! enqueue order and repeated writes of one object can coalesce.
//!
//! # Architecture
//!
//! ```text
//! enqueue_for_saving ──┐
//! enqueue_for_loading ─┼──► DbDaemon ── router ──► DbWorker[0] ── FIFO ──► driver
//! enqueue_for_* ───────┘       │                   DbWorker[1] ── FIFO ──► driver
//!                              │                        │
//!                              │                        ├── coalesce / defer / retry
//!                              │                        └── exhausted ──► dump file
//!                              └── Promise per operation
//! ```
//!
//! The actual database driver is out of scope: workers speak to it only
//! through the [`driver::DbConnection`] and [`driver::ConnectionFactory`]
//! contracts.

pub mod daemon;
pub mod driver;
pub mod dump;
pub mod object;
pub(crate) mod operation;
#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod worker;

pub use daemon::DbDaemon;
pub use driver::{ConnectionFactory, DbConnection, DbEndpoint};
pub use dump::SqlDump;
pub use object::{DbObject, WriteStamp};
pub use operation::{AccessCallback, RowCallback};
