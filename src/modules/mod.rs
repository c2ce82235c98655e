//! Shared-library loading and lifetime tracking.
//!
//! The [`ModuleDepository`] loads shared libraries, runs the initializers
//! they registered (in ascending priority, scoped to the library's address
//! range), and keeps the resulting RAII tokens alive until the module is
//! unloaded. Tokens unwind in reverse registration order strictly before
//! the library handle closes.
//!
//! All dynamic-loader calls are serialized behind one re-entrant lock: the
//! platform loader is not thread-safe, and a library's constructors may
//! call back into [`ModuleDepository::register_module_raii`] while the
//! loading thread already holds the lock.

mod depository;

pub use depository::{HandleStack, ModuleDepository, ModuleInit, ModuleSnapshot};
