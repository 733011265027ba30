//! Completion handle for a running delivery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mailrelay_smtp::SessionHandle;
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::status::DeliveryResult;

/// Terminal state of a delivery.
#[derive(Debug, Clone)]
pub enum Completion {
    /// One result per envelope, in submission order.
    Completed(Arc<[DeliveryResult]>),
    /// The delivery was cancelled before it completed.
    Cancelled,
}

impl Completion {
    fn to_result(&self) -> Result<Arc<[DeliveryResult]>> {
        match self {
            Self::Completed(results) => Ok(Arc::clone(results)),
            Self::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// Identifies a listener registered with [`DeliveryFuture::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnOnce(&Completion) + Send>;

struct State {
    completion: Option<Completion>,
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
    session: Option<SessionHandle>,
}

struct Inner {
    state: Mutex<State>,
    done: Condvar,
}

/// Handle onto an in-flight delivery.
///
/// Completes exactly once, either with one [`DeliveryResult`] per envelope or
/// as cancelled. Cloning yields another handle onto the same delivery.
/// Listeners run on whichever thread completes the delivery, after the state
/// lock is released.
#[derive(Clone)]
pub struct DeliveryFuture {
    inner: Arc<Inner>,
}

impl DeliveryFuture {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    completion: None,
                    listeners: Vec::new(),
                    next_id: 0,
                    session: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Blocks until the delivery completes.
    ///
    /// Must not be called from within an async task; use
    /// [`results`](Self::results) there.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the delivery was cancelled.
    pub fn wait(&self) -> Result<Arc<[DeliveryResult]>> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(completion) = &state.completion {
                return completion.to_result();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Blocks until the delivery completes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WaitTimeout`] if the delivery is still running after
    /// `timeout`, or [`Error::Cancelled`] if it was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Arc<[DeliveryResult]>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(completion) = &state.completion {
                return completion.to_result();
            }
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return state
                    .completion
                    .as_ref()
                    .map_or(Err(Error::WaitTimeout), Completion::to_result);
            }
        }
    }

    /// Returns the outcome if the delivery has finished.
    #[must_use]
    pub fn try_results(&self) -> Option<Result<Arc<[DeliveryResult]>>> {
        self.inner
            .state
            .lock()
            .completion
            .as_ref()
            .map(Completion::to_result)
    }

    /// Waits asynchronously for the delivery to complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the delivery was cancelled.
    pub async fn results(&self) -> Result<Arc<[DeliveryResult]>> {
        self.settled().await.to_result()
    }

    /// Waits asynchronously for the terminal state.
    pub async fn settled(&self) -> Completion {
        let (tx, rx) = oneshot::channel();
        let id = self.add_listener(move |completion| {
            let _ = tx.send(completion.clone());
        });

        let guard = ListenerGuard { future: self, id };
        let completion = rx.await;
        drop(guard);

        // The sender lives in the listener, which only ever drops after
        // firing, so a closed channel means the future completed.
        completion.unwrap_or_else(|_| {
            self.inner
                .state
                .lock()
                .completion
                .clone()
                .unwrap_or(Completion::Cancelled)
        })
    }

    /// Registers a callback run once when the delivery reaches a terminal
    /// state.
    ///
    /// If the delivery has already finished, the callback runs immediately on
    /// the calling thread.
    pub fn add_listener(&self, listener: impl FnOnce(&Completion) + Send + 'static) -> ListenerId {
        let mut state = self.inner.state.lock();
        let id = ListenerId(state.next_id);
        state.next_id += 1;

        match state.completion.clone() {
            Some(completion) => {
                drop(state);
                listener(&completion);
            }
            None => state.listeners.push((id, Box::new(listener))),
        }
        id
    }

    /// Unregisters a listener that has not run yet.
    ///
    /// Returns true if the listener was removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    /// Cancels the delivery.
    ///
    /// Closes the session (if one is attached), wakes waiters and runs
    /// listeners. Envelopes already finalized by the server stay delivered;
    /// their results are discarded. Returns false if the delivery had already
    /// finished.
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.completion.is_some() {
            return false;
        }
        state.completion = Some(Completion::Cancelled);
        let session = state.session.take();
        let listeners = std::mem::take(&mut state.listeners);
        drop(state);

        tracing::debug!("Delivery cancelled");
        if let Some(session) = session {
            session.close();
        }
        self.inner.done.notify_all();
        Self::fire(&Completion::Cancelled, listeners);
        true
    }

    /// Returns true once the delivery completed or was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().completion.is_some()
    }

    /// Returns true if the delivery was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.state.lock().completion,
            Some(Completion::Cancelled)
        )
    }

    /// Records the final results. Returns false if already terminal.
    pub(crate) fn complete(&self, results: Vec<DeliveryResult>) -> bool {
        let mut state = self.inner.state.lock();
        if state.completion.is_some() {
            return false;
        }
        let completion = Completion::Completed(results.into());
        state.completion = Some(completion.clone());
        state.session = None;
        let listeners = std::mem::take(&mut state.listeners);
        drop(state);

        self.inner.done.notify_all();
        Self::fire(&completion, listeners);
        true
    }

    /// Attaches the session so that cancellation can close it.
    ///
    /// Returns false if the delivery was already cancelled, in which case the
    /// caller must close the session itself.
    pub(crate) fn attach_session(&self, session: SessionHandle) -> bool {
        let mut state = self.inner.state.lock();
        if state.completion.is_some() {
            return false;
        }
        state.session = Some(session);
        true
    }

    fn fire(completion: &Completion, listeners: Vec<(ListenerId, Listener)>) {
        for (_, listener) in listeners {
            listener(completion);
        }
    }
}

impl std::fmt::Debug for DeliveryFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DeliveryFuture")
            .field("completion", &state.completion)
            .field("listeners", &state.listeners.len())
            .finish_non_exhaustive()
    }
}

struct ListenerGuard<'a> {
    future: &'a DeliveryFuture,
    id: ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.future.remove_listener(self.id);
    }
}
