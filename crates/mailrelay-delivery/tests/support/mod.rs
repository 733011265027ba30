//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mailrelay_smtp::{
    Capabilities, Command, ConnectOptions, Connection, Destination, Error, Reply, ReplyCode,
    Result, Session, SessionHandle, Transport,
};
use parking_lot::Mutex;

/// Installs a fmt subscriber writing through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Single-line reply.
pub fn reply(code: u16, text: &str) -> Reply {
    Reply::single(code, text)
}

/// EHLO reply advertising `extensions`.
pub fn ehlo(extensions: &[&str]) -> Reply {
    let mut lines = vec!["mx.test".to_owned()];
    lines.extend(extensions.iter().map(|e| (*e).to_owned()));
    Reply::new(ReplyCode::OK, lines)
}

/// What one connection does.
#[derive(Debug, Clone)]
pub struct Script {
    greeting: Reply,
    replies: Vec<Reply>,
    hang: bool,
}

impl Script {
    /// A connection greeting with 220 and answering with `replies` in order,
    /// then dropping.
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self::with_greeting(reply(220, "mx.test ESMTP"), replies)
    }

    /// Same as [`Script::new`] with a custom greeting.
    pub fn with_greeting(greeting: Reply, replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            greeting,
            replies: replies.into_iter().collect(),
            hang: false,
        }
    }

    /// Wait forever instead of dropping once the replies run out.
    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[derive(Debug, Default)]
struct Shared {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
    sent: Mutex<Vec<String>>,
    handles: Mutex<Vec<SessionHandle>>,
}

/// Transport handing out [`MockSession`]s, one script per connect.
///
/// Connecting with no script left fails with connection refused.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        let transport = Self::default();
        transport.shared.scripts.lock().extend(scripts);
        transport
    }

    /// Number of connect calls that reached this transport.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Everything written by every session, in order. Bodies appear as
    /// `<message N bytes>`.
    pub fn sent(&self) -> Vec<String> {
        self.shared.sent.lock().clone()
    }

    /// First word of every line written.
    pub fn verbs(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|line| line.split_whitespace().next().unwrap_or_default().to_owned())
            .collect()
    }

    /// Handles of every session opened so far.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.shared.handles.lock().clone()
    }
}

impl Transport for MockTransport {
    type Session = MockSession;

    async fn connect(
        &self,
        destination: &Destination,
        _options: &ConnectOptions,
    ) -> Result<Connection<MockSession>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.shared.scripts.lock().pop_front().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
        })?;

        let handle = SessionHandle::new();
        self.shared.handles.lock().push(handle.clone());
        let session = MockSession {
            destination: destination.clone(),
            handle,
            capabilities: Capabilities::default(),
            encrypted: false,
            authenticated_user: None,
            replies: script.replies.into(),
            hang: script.hang,
            shared: Arc::clone(&self.shared),
        };
        Ok(Connection::fresh(session, script.greeting))
    }
}

/// Session replaying a [`Script`].
#[derive(Debug)]
pub struct MockSession {
    destination: Destination,
    handle: SessionHandle,
    capabilities: Capabilities,
    encrypted: bool,
    authenticated_user: Option<String>,
    replies: VecDeque<Reply>,
    hang: bool,
    shared: Arc<Shared>,
}

impl MockSession {
    fn check_open(&self) -> Result<()> {
        if self.handle.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl Session for MockSession {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    fn set_authenticated_user(&mut self, user: Option<String>) {
        self.authenticated_user = user;
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        self.check_open()?;
        self.shared.sent.lock().push(command.to_string());
        Ok(())
    }

    async fn send_message(&mut self, message: &[u8]) -> Result<()> {
        self.check_open()?;
        self.shared
            .sent
            .lock()
            .push(format!("<message {} bytes>", message.len()));
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        self.check_open()?;
        if let Some(reply) = self.replies.pop_front() {
            return Ok(reply);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.handle.close();
        Err(Error::ConnectionClosed)
    }

    async fn start_tls(&mut self) -> Result<()> {
        self.check_open()?;
        self.encrypted = true;
        self.shared.sent.lock().push("<tls>".to_owned());
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.handle.close();
    }
}
