//! Transport and session abstractions consumed by the delivery core.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use super::SessionHandle;
use crate::command::Command;
use crate::error::Result;
use crate::types::{Capabilities, Destination, Reply};

/// Options for opening a connection, and the security a reused session has
/// to offer.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Timeout for the TCP connect and the server greeting.
    pub connect_timeout: Duration,
    /// Local address to bind before connecting.
    pub local_address: Option<SocketAddr>,
    /// A reused session must already be encrypted.
    pub require_tls: bool,
    /// User a reused session must have authenticated as; `None` requires an
    /// unauthenticated session.
    pub authenticated_as: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            local_address: None,
            require_tls: false,
            authenticated_as: None,
        }
    }
}

/// A session handed out by [`Transport::connect`].
#[derive(Debug)]
pub struct Connection<S> {
    /// The session.
    pub session: S,
    /// Server greeting. `None` when an already-negotiated session is reused.
    pub greeting: Option<Reply>,
}

impl<S> Connection<S> {
    /// A freshly opened session with its greeting.
    pub fn fresh(session: S, greeting: Reply) -> Self {
        Self {
            session,
            greeting: Some(greeting),
        }
    }

    /// A previously negotiated session being handed out again.
    pub fn reused(session: S) -> Self {
        Self {
            session,
            greeting: None,
        }
    }
}

/// One connection to a remote SMTP/LMTP endpoint.
///
/// Writes never wait for replies, so several commands may be written before
/// their replies are read back in order.
pub trait Session: Send + 'static {
    /// Endpoint this session is connected to.
    fn destination(&self) -> &Destination;

    /// Local socket address, if known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote socket address, if known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Close signalling for this session.
    fn handle(&self) -> &SessionHandle;

    /// Capabilities negotiated on this session so far.
    fn capabilities(&self) -> &Capabilities;

    /// Records newly negotiated capabilities.
    fn set_capabilities(&mut self, capabilities: Capabilities);

    /// Returns true once STARTTLS (or implicit TLS) is in effect.
    fn is_encrypted(&self) -> bool;

    /// User this session authenticated as, if any.
    fn authenticated_user(&self) -> Option<&str>;

    /// Records the user a successful AUTH exchange logged in as.
    fn set_authenticated_user(&mut self, user: Option<String>);

    /// Writes one command.
    fn send(&mut self, command: &Command) -> impl Future<Output = Result<()>> + Send;

    /// Writes a message body, dot-stuffed and terminated.
    fn send_message(&mut self, message: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Reads the next (possibly multi-line) reply.
    fn read_reply(&mut self) -> impl Future<Output = Result<Reply>> + Send;

    /// Performs the TLS handshake after a successful STARTTLS reply.
    fn start_tls(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Closes the session.
    fn close(&mut self) {
        self.handle().close();
    }

    /// Returns true once the session is closed.
    fn is_closed(&self) -> bool {
        self.handle().is_closed()
    }
}

/// Opens sessions to remote endpoints.
pub trait Transport: Send + Sync + 'static {
    /// Session type produced by this transport.
    type Session: Session;

    /// Opens (or hands out) a session to `destination`.
    fn connect(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<Connection<Self::Session>>> + Send;

    /// Takes a session back once a delivery is done with it.
    ///
    /// The default closes it.
    fn release(&self, mut session: Self::Session) {
        session.close();
    }

    /// Returns true if released sessions are kept open for reuse, in which
    /// case deliveries end without QUIT.
    fn keeps_sessions(&self) -> bool {
        false
    }
}
