//! Name-resolution scenarios through the public API.

use std::sync::Arc;
use std::time::Duration;

use capstan::dns::DnsDaemon;
use capstan::error::Error;

#[test]
fn promised_lookup_prefers_ipv4() {
    let daemon = Arc::new(DnsDaemon::new());
    daemon.start();

    let promise = daemon.enqueue_for_looking_up("localhost", 80, true);
    assert!(promise.wait(Duration::from_secs(30)));
    promise.check().unwrap();
    let addr = promise.take().unwrap();
    assert!(addr.is_ipv4());
    assert_eq!(addr.port(), 80);

    daemon.stop();
}

#[test]
fn bracketed_v6_literal_resolves_to_loopback() {
    let daemon = Arc::new(DnsDaemon::new());
    daemon.start();

    let promise = daemon.enqueue_for_looking_up("[::1]", 80, false);
    assert!(promise.wait(Duration::from_secs(30)));
    promise.check().unwrap();
    let addr = promise.take().unwrap();
    assert!(addr.is_ipv6());
    assert!(addr.ip().is_loopback());

    daemon.stop();
}

#[test]
fn unknown_host_fails_with_resolve_error() {
    let daemon = Arc::new(DnsDaemon::new());
    daemon.start();

    let promise = daemon.enqueue_for_looking_up("definitely-not-a-host.invalid", 80, true);
    assert!(promise.wait(Duration::from_secs(60)));
    match promise.check() {
        Err(Error::Resolve(_)) => {}
        other => panic!("expected a resolve error, got {other:?}"),
    }

    daemon.stop();
}

#[test]
fn lookups_queued_before_start_are_served_after() {
    let daemon = Arc::new(DnsDaemon::new());
    let promise = daemon.enqueue_for_looking_up("127.0.0.1", 443, true);
    assert!(!promise.is_satisfied());

    daemon.start();
    assert!(promise.wait(Duration::from_secs(30)));
    promise.check().unwrap();

    daemon.stop();
}
