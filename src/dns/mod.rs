//! Promised host-name resolution.
//!
//! The [`DnsDaemon`] serializes blocking lookups through the OS resolver on
//! a single background thread. Callers enqueue a request and receive an
//! `Arc<Promise<SocketAddr>>`; the daemon fulfills it once `getaddrinfo`
//! returns. A synchronous [`DnsDaemon::look_up`] is provided for callers
//! that can afford to block; it never touches the queue.

mod daemon;

pub use daemon::DnsDaemon;
