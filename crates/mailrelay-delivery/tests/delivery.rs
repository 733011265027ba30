//! End-to-end delivery dialogues against a scripted transport.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mailrelay_delivery::{
    Credentials, Deliverer, DeliveryConfig, DeliveryResult, Envelope, Error, Outcome,
    PipeliningMode, TlsMode,
};
use mailrelay_smtp::{Address, Destination};
use support::{MockTransport, Script, ehlo, init_tracing, reply};

fn destination() -> Destination {
    Destination::new("mx.test", 25).unwrap()
}

fn envelope(recipients: &[&str]) -> Envelope {
    Envelope::new(
        Some(Address::new("sender@example.org").unwrap()),
        recipients.iter().map(|r| Address::new(*r).unwrap()),
        "Subject: test\r\n\r\nHello\r\n",
    )
    .unwrap()
}

fn sequential() -> DeliveryConfig {
    DeliveryConfig::builder()
        .pipelining(PipeliningMode::Disabled)
        .build()
        .unwrap()
}

async fn run(
    transport: &MockTransport,
    config: &DeliveryConfig,
    envelopes: Vec<Envelope>,
) -> Arc<[DeliveryResult]> {
    init_tracing();
    let deliverer = Deliverer::new(transport.clone());
    let future = deliverer.deliver(&destination(), config, envelopes).unwrap();
    tokio::time::timeout(Duration::from_secs(5), future.results())
        .await
        .expect("delivery finished")
        .unwrap()
}

fn outcomes(result: &DeliveryResult) -> Vec<Outcome> {
    result
        .statuses()
        .expect("recipient statuses")
        .iter()
        .map(|status| status.outcome())
        .collect()
}

#[tokio::test]
async fn single_recipient_is_delivered() {
    let transport = MockTransport::new([Script::new([
        ehlo(&["8BITMIME"]),
        reply(250, "sender ok"),
        reply(250, "recipient ok"),
        reply(354, "go ahead"),
        reply(250, "queued as 1234"),
        reply(221, "bye"),
    ])]);

    let results = run(&transport, &DeliveryConfig::default(), vec![envelope(&["a@x.org"])]).await;

    assert_eq!(results.len(), 1);
    assert_eq!(outcomes(&results[0]), [Outcome::Ok]);
    assert_eq!(
        results[0].statuses().unwrap()[0].reply().message_text(),
        "queued as 1234"
    );
    assert_eq!(
        transport.sent(),
        [
            "EHLO localhost",
            "MAIL FROM:<sender@example.org>",
            "RCPT TO:<a@x.org>",
            "DATA",
            "<message 24 bytes>",
            "QUIT",
        ]
    );
    assert!(transport.handles()[0].is_closed());
}

#[tokio::test]
async fn rejected_recipient_does_not_abort_siblings() {
    let transport = MockTransport::new([Script::new([
        ehlo(&[]),
        reply(250, "ok"),
        reply(550, "no such user"),
        reply(250, "ok"),
        reply(354, "go ahead"),
        reply(250, "queued"),
        reply(221, "bye"),
    ])]);

    let results = run(
        &transport,
        &DeliveryConfig::default(),
        vec![envelope(&["gone@x.org", "here@x.org"])],
    )
    .await;

    let statuses = results[0].statuses().unwrap();
    assert_eq!(statuses[0].outcome(), Outcome::PermanentError);
    assert_eq!(statuses[0].reply().code.as_u16(), 550);
    assert_eq!(statuses[0].address().as_str(), "gone@x.org");
    assert_eq!(statuses[1].outcome(), Outcome::Ok);
}

#[tokio::test]
async fn all_recipients_rejected_never_sends_data() {
    let transport = MockTransport::new([Script::new([
        ehlo(&[]),
        reply(250, "ok"),
        reply(550, "no such user"),
        reply(450, "mailbox busy"),
        reply(221, "bye"),
    ])]);

    let results = run(
        &transport,
        &sequential(),
        vec![envelope(&["a@x.org", "b@x.org"])],
    )
    .await;

    assert_eq!(
        outcomes(&results[0]),
        [Outcome::PermanentError, Outcome::TemporaryError]
    );
    assert!(!transport.verbs().contains(&"DATA".to_owned()));
}

#[tokio::test]
async fn required_pipelining_fails_before_mail() {
    let transport = MockTransport::new([Script::new([ehlo(&["8BITMIME"])])]);
    let config = DeliveryConfig::builder()
        .pipelining(PipeliningMode::Required)
        .build()
        .unwrap();

    let results = run(&transport, &config, vec![envelope(&["a@x.org"])]).await;

    assert!(matches!(
        results[0].error().unwrap().as_ref(),
        Error::Unsupported("PIPELINING")
    ));
    assert_eq!(transport.verbs(), ["EHLO"]);
}

#[tokio::test]
async fn dropped_connection_fails_remaining_envelopes() {
    let transport = MockTransport::new([Script::new([
        ehlo(&[]),
        reply(250, "ok"),
        reply(250, "ok"),
        reply(354, "go ahead"),
        reply(250, "queued"),
        // Second envelope: MAIL accepted, then the peer goes away.
        reply(250, "ok"),
    ])]);

    let results = run(
        &transport,
        &sequential(),
        vec![
            envelope(&["a@x.org"]),
            envelope(&["b@x.org"]),
            envelope(&["c@x.org"]),
        ],
    )
    .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_success());
    let second = results[1].error().unwrap();
    let third = results[2].error().unwrap();
    assert!(Arc::ptr_eq(second, third));
    assert!(matches!(
        second.as_ref(),
        Error::Smtp(mailrelay_smtp::Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn pipelined_envelopes_share_one_connection() {
    let transport = MockTransport::new([Script::new([
        ehlo(&["PIPELINING"]),
        reply(250, "ok"),
        reply(250, "ok"),
        reply(354, "go ahead"),
        reply(250, "queued"),
        reply(250, "ok"),
        reply(550, "unknown"),
        reply(554, "no valid recipients"),
        reply(250, "reset"),
        reply(250, "ok"),
        reply(250, "ok"),
        reply(354, "go ahead"),
        reply(250, "queued"),
        reply(221, "bye"),
    ])]);

    let results = run(
        &transport,
        &DeliveryConfig::default(),
        vec![
            envelope(&["a@x.org"]),
            envelope(&["b@x.org"]),
            envelope(&["c@x.org"]),
        ],
    )
    .await;

    assert_eq!(transport.connects(), 1);
    assert!(results[0].is_success());
    assert_eq!(outcomes(&results[1]), [Outcome::PermanentError]);
    assert_eq!(results[1].statuses().unwrap()[0].reply().code.as_u16(), 550);
    assert!(results[2].is_success());
    assert_eq!(
        transport.verbs(),
        [
            "EHLO", "MAIL", "RCPT", "DATA", "<message", "MAIL", "RCPT", "DATA", "RSET", "MAIL",
            "RCPT", "DATA", "<message", "QUIT",
        ]
    );
}

#[tokio::test]
async fn starttls_and_auth_precede_mail() {
    let transport = MockTransport::new([Script::new([
        ehlo(&["STARTTLS", "PIPELINING"]),
        reply(220, "ready for TLS"),
        ehlo(&["PIPELINING", "AUTH LOGIN PLAIN"]),
        reply(334, ""),
        reply(235, "authenticated"),
        reply(250, "ok"),
        reply(250, "ok"),
        reply(354, "go ahead"),
        reply(250, "queued"),
        reply(221, "bye"),
    ])]);
    let config = DeliveryConfig::builder()
        .tls(TlsMode::Required)
        .credentials(Credentials::plain("user", "secret"))
        .build()
        .unwrap();

    let results = run(&transport, &config, vec![envelope(&["a@x.org"])]).await;

    assert!(results[0].is_success());
    assert_eq!(
        transport.verbs(),
        [
            "EHLO", "STARTTLS", "<tls>", "EHLO", "AUTH", "****", "MAIL", "RCPT", "DATA",
            "<message", "QUIT",
        ]
    );
    assert!(!transport.sent().iter().any(|line| line.contains("AHVzZXIAc2VjcmV0")));
}

#[tokio::test]
async fn failed_authentication_is_fatal() {
    let transport = MockTransport::new([Script::new([
        ehlo(&["AUTH PLAIN"]),
        reply(334, ""),
        reply(535, "authentication failed"),
    ])]);
    let config = DeliveryConfig::builder()
        .tls(TlsMode::Disabled)
        .credentials(Credentials::plain("user", "wrong"))
        .build()
        .unwrap();

    let results = run(
        &transport,
        &config,
        vec![envelope(&["a@x.org"]), envelope(&["b@x.org"])],
    )
    .await;

    for result in results.iter() {
        assert!(matches!(
            result.error().unwrap().as_ref(),
            Error::Authentication { code: 535, .. }
        ));
    }
    assert!(!transport.verbs().contains(&"MAIL".to_owned()));
}

#[tokio::test]
async fn lmtp_reports_each_recipient_after_data() {
    let transport = MockTransport::new([Script::new([
        ehlo(&["PIPELINING"]),
        reply(250, "ok"),
        reply(250, "ok"),
        reply(250, "ok"),
        reply(354, "go ahead"),
        reply(250, "delivered to a"),
        reply(452, "b over quota"),
        reply(221, "bye"),
    ])]);
    let config = DeliveryConfig::lmtp().build().unwrap();

    let results = run(&transport, &config, vec![envelope(&["a@x.org", "b@x.org"])]).await;

    assert_eq!(outcomes(&results[0]), [Outcome::Ok, Outcome::TemporaryError]);
    assert_eq!(transport.verbs()[0], "LHLO");
}

#[tokio::test]
async fn null_sender_is_sent_as_empty_path() {
    let transport = MockTransport::new([Script::new([
        ehlo(&[]),
        reply(250, "ok"),
        reply(250, "ok"),
        reply(354, "go ahead"),
        reply(250, "queued"),
        reply(221, "bye"),
    ])]);
    let bounce = Envelope::new(None, [Address::new("a@x.org").unwrap()], "bounce").unwrap();

    let results = run(&transport, &DeliveryConfig::default(), vec![bounce]).await;

    assert!(results[0].is_success());
    assert_eq!(transport.sent()[1], "MAIL FROM:<>");
}

#[tokio::test]
async fn refused_connection_fails_every_envelope() {
    let transport = MockTransport::new([]);

    let results = run(
        &transport,
        &DeliveryConfig::default(),
        vec![envelope(&["a@x.org"]), envelope(&["b@x.org"])],
    )
    .await;

    assert_eq!(results.len(), 2);
    for result in results.iter() {
        let error = result.error().unwrap();
        assert!(error.is_transient());
        assert!(matches!(error.as_ref(), Error::Smtp(mailrelay_smtp::Error::Io(_))));
    }
}

#[tokio::test]
async fn empty_envelope_list_is_rejected_without_connecting() {
    let transport = MockTransport::new([Script::new([])]);
    let deliverer = Deliverer::new(transport.clone());

    let err = deliverer
        .deliver(&destination(), &DeliveryConfig::default(), Vec::new())
        .unwrap_err();

    assert!(matches!(err, Error::NoEnvelopes));
    assert!(err.is_argument_error());
    assert_eq!(transport.connects(), 0);
}

#[tokio::test]
async fn cancel_closes_session_and_fires_listeners() {
    init_tracing();
    let transport = MockTransport::new([Script::new([ehlo(&[])]).then_hang()]);
    let deliverer = Deliverer::new(transport.clone());
    let future = deliverer
        .deliver(&destination(), &DeliveryConfig::default(), [envelope(&["a@x.org"])])
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    future.add_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    while transport.sent().len() < 2 {
        tokio::task::yield_now().await;
    }
    assert!(future.cancel());
    assert!(!future.cancel());

    assert!(matches!(future.results().await, Err(Error::Cancelled)));
    assert!(future.is_cancelled());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(transport.handles()[0].is_closed());
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out() {
    let transport = MockTransport::new([Script::new([ehlo(&[])]).then_hang()]);
    let config = DeliveryConfig::builder()
        .response_timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    let results = run(&transport, &config, vec![envelope(&["a@x.org"])]).await;

    assert!(matches!(
        results[0].error().unwrap().as_ref(),
        Error::Timeout(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_wait_sees_completion() {
    let transport = MockTransport::new([Script::new([
        ehlo(&[]),
        reply(250, "ok"),
        reply(250, "ok"),
        reply(354, "go ahead"),
        reply(250, "queued"),
        reply(221, "bye"),
    ])]);
    let deliverer = Deliverer::new(transport);
    let future = deliverer
        .deliver(&destination(), &DeliveryConfig::default(), [envelope(&["a@x.org"])])
        .unwrap();

    let results = tokio::task::spawn_blocking(move || future.wait_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert!(results[0].is_success());
}
