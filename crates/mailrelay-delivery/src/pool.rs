//! Reuse of idle sessions.

use std::collections::{HashMap, VecDeque};

use mailrelay_smtp::{Command, ConnectOptions, Connection, Destination, Reply, Session, Transport};
use parking_lot::Mutex;

/// Default number of idle sessions kept per destination.
pub const DEFAULT_MAX_IDLE: usize = 4;

/// A [`Transport`] that keeps released sessions open and hands them out
/// again for the same destination.
///
/// The least recently returned idle session that satisfies the request's
/// TLS and AUTH policy is handed out first, after answering a `NOOP`.
/// Sessions closed while idle, or failing the `NOOP`, are discarded.
/// Deliveries over a pool end without QUIT; call
/// [`close_idle`](Self::close_idle) to shut the idle sessions down.
pub struct SessionPool<T: Transport> {
    inner: T,
    max_idle: usize,
    idle: Mutex<HashMap<Destination, VecDeque<T::Session>>>,
}

impl<T: Transport> SessionPool<T> {
    /// Wraps `inner`, keeping up to [`DEFAULT_MAX_IDLE`] sessions per
    /// destination.
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self::with_max_idle(inner, DEFAULT_MAX_IDLE)
    }

    /// Wraps `inner`, keeping up to `max_idle` sessions per destination.
    #[must_use]
    pub fn with_max_idle(inner: T, max_idle: usize) -> Self {
        Self {
            inner,
            max_idle,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped transport.
    #[must_use]
    pub const fn inner(&self) -> &T {
        &self.inner
    }

    /// Number of idle sessions held for `destination`.
    #[must_use]
    pub fn idle_count(&self, destination: &Destination) -> usize {
        self.idle
            .lock()
            .get(destination)
            .map_or(0, |sessions| {
                sessions.iter().filter(|session| !session.is_closed()).count()
            })
    }

    /// Closes and discards every idle session.
    pub fn close_idle(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for session in idle.into_values().flatten() {
            self.inner.release(session);
        }
    }

    fn checkout(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> Option<T::Session> {
        let mut idle = self.idle.lock();
        let sessions = idle.get_mut(destination)?;
        sessions.retain(|session| !session.is_closed());
        let found = sessions
            .iter()
            .position(|session| satisfies(session, options))
            .and_then(|index| sessions.remove(index));
        if sessions.is_empty() {
            idle.remove(destination);
        }
        found
    }
}

fn satisfies<S: Session>(session: &S, options: &ConnectOptions) -> bool {
    (session.is_encrypted() || !options.require_tls)
        && session.authenticated_user() == options.authenticated_as.as_deref()
}

async fn noop<S: Session>(session: &mut S) -> mailrelay_smtp::Result<Reply> {
    session.send(&Command::Noop).await?;
    session.read_reply().await
}

impl<T: Transport> Transport for SessionPool<T> {
    type Session = T::Session;

    async fn connect(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> mailrelay_smtp::Result<Connection<T::Session>> {
        while let Some(mut session) = self.checkout(destination, options) {
            match tokio::time::timeout(options.connect_timeout, noop(&mut session)).await {
                Ok(Ok(reply)) if reply.is_success() => {
                    tracing::debug!(%destination, "Reusing pooled session");
                    return Ok(Connection::reused(session));
                }
                _ => {
                    tracing::debug!(%destination, "Pooled session failed NOOP, discarding");
                    session.close();
                    self.inner.release(session);
                }
            }
        }

        tracing::debug!(%destination, "No idle session, connecting");
        self.inner.connect(destination, options).await
    }

    fn release(&self, session: T::Session) {
        if session.is_closed() {
            self.inner.release(session);
            return;
        }

        let mut idle = self.idle.lock();
        let sessions = idle.entry(session.destination().clone()).or_default();
        if sessions.len() < self.max_idle {
            sessions.push_back(session);
            return;
        }
        drop(idle);

        tracing::debug!(destination = %session.destination(), "Pool full, closing session");
        self.inner.release(session);
    }

    fn keeps_sessions(&self) -> bool {
        true
    }
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for SessionPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idle: usize = self.idle.lock().values().map(VecDeque::len).sum();
        f.debug_struct("SessionPool")
            .field("inner", &self.inner)
            .field("max_idle", &self.max_idle)
            .field("idle", &idle)
            .finish()
    }
}
