//! Delivery entry point and the task driving a session.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mailrelay_smtp::{Destination, Session, Transport};

use crate::config::DeliveryConfig;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::future::DeliveryFuture;
use crate::machine::{Action, DeliveryMachine};

/// Delivers envelopes through a shared transport.
///
/// Cloning is cheap; clones share the transport.
#[derive(Debug)]
pub struct Deliverer<T> {
    transport: Arc<T>,
}

impl<T> Clone for Deliverer<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> Deliverer<T> {
    /// Creates a deliverer over `transport`.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    /// Creates a deliverer over an already shared transport.
    #[must_use]
    pub const fn from_arc(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Starts delivering `envelopes` to `destination` over one session.
    ///
    /// Must be called within a tokio runtime. See [`deliver`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEnvelopes`] if `envelopes` is empty.
    pub fn deliver(
        &self,
        destination: &Destination,
        config: &DeliveryConfig,
        envelopes: impl IntoIterator<Item = Envelope>,
    ) -> Result<DeliveryFuture> {
        deliver(
            Arc::clone(&self.transport),
            destination,
            config,
            envelopes,
        )
    }
}

/// Starts delivering `envelopes` to `destination` over one session.
///
/// Validation happens before any network activity. The returned future
/// completes with one [`DeliveryResult`](crate::DeliveryResult) per envelope,
/// in order, once the dialogue ends.
///
/// Must be called within a tokio runtime.
///
/// # Errors
///
/// Returns [`Error::NoEnvelopes`] if `envelopes` is empty.
pub fn deliver<T: Transport>(
    transport: Arc<T>,
    destination: &Destination,
    config: &DeliveryConfig,
    envelopes: impl IntoIterator<Item = Envelope>,
) -> Result<DeliveryFuture> {
    let envelopes: Vec<Envelope> = envelopes.into_iter().collect();
    if envelopes.is_empty() {
        return Err(Error::NoEnvelopes);
    }

    let future = DeliveryFuture::new();
    let machine = DeliveryMachine::new(config.clone(), envelopes, transport.keeps_sessions());
    tokio::spawn(run(
        transport,
        destination.clone(),
        config.clone(),
        machine,
        future.clone(),
    ));
    Ok(future)
}

#[tracing::instrument(name = "delivery", skip_all, fields(%destination))]
async fn run<T: Transport>(
    transport: Arc<T>,
    destination: Destination,
    config: DeliveryConfig,
    mut machine: DeliveryMachine,
    future: DeliveryFuture,
) {
    let options = config.connect_options();
    let connection = tokio::select! {
        result = transport.connect(&destination, &options) => result,
        () = wait_cancelled(&future) => return,
    };

    let connection = match connection {
        Ok(connection) => connection,
        Err(e) => {
            tracing::debug!(error = %e, "Connect failed");
            machine.fail(e.into());
            future.complete(machine.into_results());
            return;
        }
    };

    let mut session = connection.session;
    let handle = session.handle().clone();
    if !future.attach_session(handle.clone()) {
        session.close();
        transport.release(session);
        return;
    }

    let actions = machine.on_connected(
        connection.greeting,
        session.capabilities().clone(),
        session.is_encrypted(),
        session.authenticated_user(),
    );

    let outcome = tokio::select! {
        biased;
        result = drive(&mut session, &mut machine, actions, config.response_timeout()) => result,
        () = handle.closed() => Err(if future.is_cancelled() {
            Error::Cancelled
        } else {
            Error::ConnectionClosed
        }),
    };
    if let Err(e) = outcome {
        machine.fail(e);
    }

    if machine.is_reusable() && !session.is_closed() {
        session.set_capabilities(machine.capabilities().clone());
        session.set_authenticated_user(machine.authenticated_as().map(str::to_owned));
    } else {
        session.close();
    }
    transport.release(session);

    if future.complete(machine.into_results()) {
        tracing::debug!("Delivery complete");
    }
}

async fn wait_cancelled(future: &DeliveryFuture) {
    future.settled().await;
}

/// Performs the machine's actions and feeds it replies until it finishes.
async fn drive<S: Session>(
    session: &mut S,
    machine: &mut DeliveryMachine,
    actions: Vec<Action>,
    response_timeout: Duration,
) -> Result<()> {
    let mut pending: VecDeque<Action> = actions.into();
    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Send(command) => {
                    timed(response_timeout, command.verb(), session.send(&command)).await?;
                }
                Action::SendMessage(body) => {
                    timed(response_timeout, "message", session.send_message(&body)).await?;
                }
                Action::StartTls => {
                    timed(response_timeout, "TLS handshake", session.start_tls()).await?;
                    pending.extend(machine.on_tls_established());
                }
            }
        }

        if machine.is_finished() {
            return Ok(());
        }
        if !machine.awaiting_reply() {
            return Err(Error::Protocol("Dialogue stalled".into()));
        }

        let reply = timed(response_timeout, "reply", session.read_reply()).await?;
        pending.extend(machine.on_reply(reply));
    }
}

async fn timed<F, T>(timeout: Duration, what: &str, operation: F) -> Result<T>
where
    F: Future<Output = mailrelay_smtp::Result<T>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| Error::Timeout(what.to_owned()))?
        .map_err(Error::from)
}
