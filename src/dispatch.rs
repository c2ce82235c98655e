//! Thin contract for the external job dispatcher.
//!
//! The dispatch queue that actually executes user callbacks lives outside
//! this crate; the timer daemon only *produces* jobs for it. These traits
//! are the whole surface the daemons consume.

use crate::error::Error;

/// A unit of deferred work handed to the external dispatcher.
pub trait Job: Send {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Runs the job on a dispatcher thread, consuming it.
    fn perform(self: Box<Self>);
}

/// Accepts jobs for later execution on the dispatcher's own pool.
///
/// Implementations must be safe to call from any daemon thread. `enqueue`
/// must not block on the job's execution.
pub trait JobDispatcher: Send + Sync {
    /// Queues a job; fails if the dispatcher no longer accepts work.
    fn enqueue(&self, job: Box<dyn Job>) -> Result<(), Error>;
}
