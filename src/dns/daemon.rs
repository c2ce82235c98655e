//! The name-resolution daemon.
//!
//! One thread, one FIFO. Each head element is resolved with a blocking
//! `getaddrinfo` call (via `ToSocketAddrs`); the promise is fulfilled or
//! failed outside the queue lock and the element is popped afterwards, so
//! the queue length always reflects unfinished work. Requests whose
//! promise was abandoned are dropped without resolving.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::promise::Promise;

/// Upper bound of the adaptive idle backoff, in milliseconds.
const MAX_IDLE_BACKOFF_MS: u64 = 128;

struct Request {
    promise: Weak<Promise<SocketAddr>>,
    host: String,
    port: u16,
    prefer_ipv4: bool,
}

/// Strips one pair of enclosing brackets from an IPv6 literal.
fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host)
}

/// Blocking resolution through the OS resolver.
///
/// Picks the first record of the preferred address family, falling back to
/// the first record of the other family, and fails only when the resolver
/// returned nothing at all.
fn resolve(host: &str, port: u16, prefer_ipv4: bool) -> Result<SocketAddr, Error> {
    let host = strip_brackets(host);
    let records: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| {
            debug!(host, port, error = %err, "DNS lookup failure");
            Error::Resolve(err.to_string())
        })?
        .collect();

    let preferred = records
        .iter()
        .find(|addr| addr.is_ipv4() == prefer_ipv4)
        .or_else(|| records.first())
        .copied();
    match preferred {
        Some(addr) => {
            debug!(host, port, %addr, "DNS lookup success");
            Ok(addr)
        }
        None => Err(Error::Resolve(format!("no address records for {host}"))),
    }
}

/// State shared between the daemon facade and its lookup thread.
struct DnsCore {
    running: AtomicBool,
    queue: Mutex<VecDeque<Request>>,
    new_request: Condvar,
}

impl DnsCore {
    /// Resolves the head request, if any. Returns whether one was handled.
    fn pump_one_element(&self) -> bool {
        let (host, port, prefer_ipv4) = {
            let mut queue = self.queue.lock().unwrap();
            let Some(head) = queue.front() else {
                return false;
            };
            if head.promise.strong_count() == 0 {
                // Nobody is waiting any more.
                queue.pop_front();
                return true;
            }
            (head.host.clone(), head.port, head.prefer_ipv4)
        };

        let result = resolve(&host, port, prefer_ipv4);
        if let Err(err) = &result {
            warn!(host = %host, port, error = %err, "DNS lookup failed");
        }

        // Fulfill outside the lock; only this thread pops, so the head is
        // still our request.
        let promise = {
            let queue = self.queue.lock().unwrap();
            queue.front().and_then(|head| head.promise.upgrade())
        };
        if let Some(promise) = promise {
            let _ = match result {
                Ok(addr) => promise.set_success(addr, false),
                Err(err) => promise.set_error(err, false),
            };
        }

        self.queue.lock().unwrap().pop_front();
        true
    }

    fn run_loop(&self) {
        info!("DNS daemon started");

        let mut timeout: u64 = 0;
        loop {
            loop {
                let busy = self.pump_one_element();
                let cap = if busy { 0 } else { MAX_IDLE_BACKOFF_MS };
                timeout = (timeout * 2 + 1).min(cap);
                if !busy {
                    break;
                }
            }

            let guard = self.queue.lock().unwrap();
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            let _ = self
                .new_request
                .wait_timeout(guard, Duration::from_millis(timeout))
                .unwrap();
        }

        info!("DNS daemon stopped");
    }
}

/// The name-resolution daemon.
pub struct DnsDaemon {
    core: Arc<DnsCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DnsDaemon {
    /// Creates a stopped daemon.
    pub fn new() -> Self {
        Self {
            core: Arc::new(DnsCore {
                running: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                new_request: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the lookup thread. Idempotent.
    pub fn start(&self) {
        if self.core.running.swap(true, Ordering::AcqRel) {
            warn!("DNS daemon is already running");
            return;
        }
        info!("Starting DNS daemon...");

        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("dns-lookup".to_string())
            .spawn(move || core.run_loop())
            .expect("failed to spawn DNS daemon thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Stops the daemon: joins the thread and clears the queue.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.core.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping DNS daemon...");

        self.core.new_request.notify_all();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.join() {
                warn!("DNS daemon thread panicked: {:?}", err);
            }
        }
        self.core.queue.lock().unwrap().clear();
    }

    /// Synchronous convenience lookup; blocks the calling thread and never
    /// touches the queue.
    pub fn look_up(host: &str, port: u16, prefer_ipv4: bool) -> Result<SocketAddr, Error> {
        resolve(host, port, prefer_ipv4)
    }

    /// Queues a lookup; the returned promise is fulfilled on the daemon
    /// thread with the chosen address, or failed with [`Error::Resolve`].
    pub fn enqueue_for_looking_up(
        &self,
        host: impl Into<String>,
        port: u16,
        prefer_ipv4: bool,
    ) -> Arc<Promise<SocketAddr>> {
        let promise = Arc::new(Promise::new());
        {
            let mut queue = self.core.queue.lock().unwrap();
            queue.push_back(Request {
                promise: Arc::downgrade(&promise),
                host: host.into(),
                port,
                prefer_ipv4,
            });
        }
        self.core.new_request.notify_one();
        promise
    }

    /// Number of unfinished lookups, counting the one in progress.
    pub fn queue_size(&self) -> usize {
        self.core.queue.lock().unwrap().len()
    }
}

impl Default for DnsDaemon {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_brackets() {
        assert_eq!(strip_brackets("[::1]"), "::1");
        assert_eq!(strip_brackets("::1"), "::1");
        assert_eq!(strip_brackets("example.com"), "example.com");
        assert_eq!(strip_brackets("[half"), "[half");
    }

    #[test]
    fn test_synchronous_lookup_of_v4_literal() {
        let addr = DnsDaemon::look_up("127.0.0.1", 8080, true).unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_synchronous_lookup_of_bracketed_v6_literal() {
        let addr = DnsDaemon::look_up("[::1]", 443, false).unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 443);
    }

    #[test]
    fn test_family_fallback_when_preference_unavailable() {
        // A v4 literal cannot yield a v6 record; the fallback picks the
        // record that exists.
        let addr = DnsDaemon::look_up("127.0.0.1", 80, false).unwrap();
        assert!(addr.is_ipv4());
    }

    #[test]
    fn test_enqueued_lookup_fulfills_promise() {
        let daemon = DnsDaemon::new();
        daemon.start();

        let promise = daemon.enqueue_for_looking_up("127.0.0.1", 80, true);
        assert!(promise.wait(Duration::from_secs(10)));
        promise.check().unwrap();
        let addr = promise.take().unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 80);

        daemon.stop();
    }

    #[test]
    fn test_unknown_host_fails_promise() {
        let daemon = DnsDaemon::new();
        daemon.start();

        // The .invalid TLD is reserved and never resolves.
        let promise = daemon.enqueue_for_looking_up("no-such-host.invalid", 80, true);
        assert!(promise.wait(Duration::from_secs(30)));
        match promise.check() {
            Err(Error::Resolve(_)) => {}
            other => panic!("expected Resolve error, got {other:?}"),
        }

        daemon.stop();
    }

    #[test]
    fn test_abandoned_promise_is_discarded() {
        let daemon = DnsDaemon::new();
        let promise = daemon.enqueue_for_looking_up("127.0.0.1", 80, true);
        drop(promise);

        // The daemon starts after the consumer has gone away; the entry is
        // dropped without resolving and the queue drains.
        daemon.start();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(daemon.queue_size(), 0);
        daemon.stop();
    }

    #[test]
    fn test_requests_are_served_in_order() {
        let daemon = DnsDaemon::new();
        daemon.start();

        let first = daemon.enqueue_for_looking_up("127.0.0.1", 1, true);
        let second = daemon.enqueue_for_looking_up("127.0.0.1", 2, true);

        assert!(second.wait(Duration::from_secs(10)));
        // FIFO: by the time the second one finished, the first must have.
        assert!(first.is_satisfied());

        daemon.stop();
    }
}
