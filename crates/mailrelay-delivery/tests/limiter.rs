//! Admission control over a scripted transport.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::time::Duration;

use mailrelay_delivery::{ConnectionLimiter, Deliverer, DeliveryConfig, Envelope};
use mailrelay_smtp::{Address, ConnectOptions, Destination, Error, Session, Transport};
use support::{MockTransport, Script, ehlo, reply};
use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};

fn destination() -> Destination {
    Destination::new("mx.test", 25).unwrap()
}

fn idle_scripts(count: usize) -> Vec<Script> {
    (0..count).map(|_| Script::new([])).collect()
}

#[test]
fn third_connect_beyond_capacity_is_rejected_without_transport_call() {
    let limiter = ConnectionLimiter::new(MockTransport::new(idle_scripts(3)), 1, 1);
    let destination = destination();
    let options = ConnectOptions::default();

    let mut first = task::spawn(limiter.connect(&destination, &options));
    let connection = assert_ready_ok!(first.poll());

    let mut second = task::spawn(limiter.connect(&destination, &options));
    assert_pending!(second.poll());

    let mut third = task::spawn(limiter.connect(&destination, &options));
    let err = assert_ready_err!(third.poll());
    assert!(matches!(err, Error::LimitExceeded { active: 1, queued: 1 }));
    assert_eq!(limiter.inner().connects(), 1);
    assert_eq!(limiter.active(), 1);
    assert_eq!(limiter.queued(), 1);

    let mut session = connection.session;
    session.close();
    assert!(second.is_woken());
    let _second = assert_ready_ok!(second.poll());
    assert_eq!(limiter.inner().connects(), 2);
    assert_eq!(limiter.active(), 1);
}

#[test]
fn queued_requests_are_admitted_in_arrival_order() {
    let limiter = ConnectionLimiter::new(MockTransport::new(idle_scripts(3)), 1, 2);
    let destination = destination();
    let options = ConnectOptions::default();

    let mut first = task::spawn(limiter.connect(&destination, &options));
    let first_connection = assert_ready_ok!(first.poll());
    let mut second = task::spawn(limiter.connect(&destination, &options));
    let mut third = task::spawn(limiter.connect(&destination, &options));
    assert_pending!(second.poll());
    assert_pending!(third.poll());

    drop(first_connection);
    assert_pending!(third.poll());
    let second_connection = assert_ready_ok!(second.poll());

    drop(second_connection);
    assert_ready_ok!(third.poll());
}

#[test]
fn abandoned_request_gives_up_its_place() {
    let limiter = ConnectionLimiter::new(MockTransport::new(idle_scripts(2)), 1, 1);
    let destination = destination();
    let options = ConnectOptions::default();

    let mut first = task::spawn(limiter.connect(&destination, &options));
    let connection = assert_ready_ok!(first.poll());
    let mut second = task::spawn(limiter.connect(&destination, &options));
    assert_pending!(second.poll());
    drop(second);

    drop(connection);
    assert_eq!(limiter.active(), 0);
    assert_eq!(limiter.queued(), 0);
}

#[test]
fn failed_connect_releases_slot() {
    let limiter = ConnectionLimiter::new(MockTransport::new([]), 1, 0);
    let destination = destination();
    let options = ConnectOptions::default();

    let mut attempt = task::spawn(limiter.connect(&destination, &options));
    assert!(matches!(assert_ready_err!(attempt.poll()), Error::Io(_)));
    assert_eq!(limiter.active(), 0);
}

#[tokio::test]
async fn deliveries_wait_for_a_free_slot() {
    support::init_tracing();
    let script = || {
        Script::new([
            ehlo(&[]),
            reply(250, "ok"),
            reply(250, "ok"),
            reply(354, "go ahead"),
            reply(250, "queued"),
            reply(221, "bye"),
        ])
    };
    let transport = MockTransport::new([script(), script()]);
    let deliverer = Deliverer::new(ConnectionLimiter::new(transport.clone(), 1, 1));
    let config = DeliveryConfig::default();
    let envelope = Envelope::new(None, [Address::new("a@x.org").unwrap()], "hello").unwrap();

    let first = deliverer
        .deliver(&destination(), &config, [envelope.clone()])
        .unwrap();
    let second = deliverer.deliver(&destination(), &config, [envelope]).unwrap();

    for future in [first, second] {
        let results = tokio::time::timeout(Duration::from_secs(5), future.results())
            .await
            .unwrap()
            .unwrap();
        assert!(results[0].is_success());
    }
    assert_eq!(transport.connects(), 2);
    assert_eq!(deliverer.transport().active(), 0);
}
