//! Bounds on concurrent connections.

use std::collections::VecDeque;
use std::sync::Arc;

use mailrelay_smtp::{ConnectOptions, Connection, Destination, Session, Transport};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A [`Transport`] admitting at most `max_active` open sessions, with up to
/// `max_queued` further connect requests waiting in arrival order.
///
/// A slot is held from admission until the session closes, however it
/// closes. Requests beyond both bounds fail immediately with
/// [`mailrelay_smtp::Error::LimitExceeded`] without reaching the inner
/// transport.
#[derive(Debug)]
pub struct ConnectionLimiter<T> {
    inner: T,
    admission: Arc<Admission>,
}

impl<T: Transport> ConnectionLimiter<T> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: T, max_active: usize, max_queued: usize) -> Self {
        Self {
            inner,
            admission: Arc::new(Admission {
                max_active,
                max_queued,
                state: Mutex::new(AdmissionState {
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// The wrapped transport.
    #[must_use]
    pub const fn inner(&self) -> &T {
        &self.inner
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.admission.state.lock().active
    }

    /// Number of requests waiting for a slot.
    #[must_use]
    pub fn queued(&self) -> usize {
        let mut state = self.admission.state.lock();
        state.waiters.retain(|waiter| !waiter.is_closed());
        state.waiters.len()
    }
}

impl<T: Transport> Transport for ConnectionLimiter<T> {
    type Session = T::Session;

    async fn connect(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> mailrelay_smtp::Result<Connection<T::Session>> {
        let permit = match self.admission.acquire()? {
            Admit::Ready(permit) => permit,
            Admit::Queued(slot) => {
                tracing::debug!(%destination, "Connection queued");
                slot.await.map_err(|_| mailrelay_smtp::Error::ConnectionClosed)?
            }
        };

        tracing::trace!(%destination, "Connection admitted");
        let connection = self.inner.connect(destination, options).await?;
        connection.session.handle().on_close(move || drop(permit));
        Ok(connection)
    }

    fn release(&self, session: T::Session) {
        self.inner.release(session);
    }

    fn keeps_sessions(&self) -> bool {
        self.inner.keeps_sessions()
    }
}

#[derive(Debug)]
struct Admission {
    max_active: usize,
    max_queued: usize,
    state: Mutex<AdmissionState>,
}

#[derive(Debug)]
struct AdmissionState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

enum Admit {
    Ready(Permit),
    Queued(oneshot::Receiver<Permit>),
}

impl Admission {
    fn acquire(self: &Arc<Self>) -> mailrelay_smtp::Result<Admit> {
        let mut state = self.state.lock();
        if state.active < self.max_active {
            state.active += 1;
            return Ok(Admit::Ready(Permit::new(Arc::clone(self))));
        }

        state.waiters.retain(|waiter| !waiter.is_closed());
        if state.waiters.len() < self.max_queued {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            return Ok(Admit::Queued(rx));
        }

        tracing::debug!(
            active = state.active,
            queued = state.waiters.len(),
            "Connection rejected"
        );
        Err(mailrelay_smtp::Error::LimitExceeded {
            active: self.max_active,
            queued: self.max_queued,
        })
    }

    /// Hands a freed slot to the oldest live waiter, or gives it back.
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Permit::new(Arc::clone(self))) {
                Ok(()) => return,
                Err(permit) => permit.disarm(),
            }
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// One admitted slot, released on drop.
#[derive(Debug)]
struct Permit {
    admission: Option<Arc<Admission>>,
}

impl Permit {
    const fn new(admission: Arc<Admission>) -> Self {
        Self {
            admission: Some(admission),
        }
    }

    /// Drops the permit without releasing its slot.
    fn disarm(mut self) {
        self.admission = None;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            admission.release();
        }
    }
}
