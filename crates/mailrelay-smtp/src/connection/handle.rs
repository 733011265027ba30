//! Close signalling shared between a session and its observers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

type CloseListener = Box<dyn FnOnce() + Send>;

/// Cloneable handle onto a session's closed flag.
///
/// The task driving a session owns the session itself; anything else that
/// needs to close it (a cancelled delivery) or to learn that it closed (a
/// connection limiter releasing its slot) holds a `SessionHandle`.
#[derive(Clone, Default)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    closed: AtomicBool,
    notify: Notify,
    listeners: Mutex<Vec<CloseListener>>,
}

impl SessionHandle {
    /// Creates an open handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the session closed, wakes waiters and runs close listeners.
    ///
    /// Returns false if the session was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.inner.notify.notify_waiters();
        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in listeners {
            listener();
        }
        true
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Registers a callback run once when the session closes.
    ///
    /// Runs immediately if the session is already closed.
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = self.inner.listeners.lock();
        if self.is_closed() {
            drop(listeners);
            listener();
        } else {
            listeners.push(Box::new(listener));
        }
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
