use core::pin::pin;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
pub(crate) enum Status<T, E> {
    Starting,
    LeaderDrop,
    Done(Result<T, E>),
}

/// What a waiter takes away from a call.
#[derive(Debug)]
pub(crate) enum Outcome<T, E> {
    Settled(Result<T, E>),
    /// The leader went away without producing a result.
    Abandoned,
}

/// An in-flight or just-completed execution for a single key.
///
/// Written once by its leader, read by any number of waiters. Blocking
/// waiters park on `cvar`, async waiters on `notify`; `settle` wakes both.
pub(crate) struct Call<T, E> {
    status: Mutex<Status<T, E>>,
    cvar: Condvar,
    notify: Notify,
    dups: AtomicUsize,
}

impl<T, E> Call<T, E> {
    pub(crate) fn new() -> Self {
        Call {
            status: Mutex::new(Status::Starting),
            cvar: Condvar::new(),
            notify: Notify::new(),
            dups: AtomicUsize::new(0),
        }
    }

    /// Must be called with the registry lock held.
    pub(crate) fn add_dup(&self) {
        self.dups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn has_dups(&self) -> bool {
        self.dups.load(Ordering::Relaxed) > 0
    }

    /// Stores the final status and releases every waiter.
    pub(crate) fn settle(&self, status: Status<T, E>) {
        *self.status.lock() = status;
        self.cvar.notify_all();
        self.notify.notify_waiters();
        trace!("Call settled");
    }
}

impl<T: Clone, E: Clone> Call<T, E> {
    fn peek(&self) -> Option<Outcome<T, E>> {
        match &*self.status.lock() {
            Status::Starting => None,
            Status::LeaderDrop => Some(Outcome::Abandoned),
            Status::Done(result) => Some(Outcome::Settled(result.clone())),
        }
    }

    /// Blocks the current thread until the leader settles the call.
    pub(crate) fn wait(&self) -> Outcome<T, E> {
        let mut status = self.status.lock();
        loop {
            match &*status {
                Status::Starting => {
                    trace!("Not done, waiting...");
                    self.cvar.wait(&mut status);
                    trace!("Work done noticed");
                }
                Status::LeaderDrop => return Outcome::Abandoned,
                Status::Done(result) => return Outcome::Settled(result.clone()),
            }
        }
    }

    /// Like `wait` but yields to the executor instead of blocking.
    pub(crate) async fn wait_async(&self) -> Outcome<T, E> {
        loop {
            // Register interest before looking, or a settle landing between
            // the look and the await would be missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(outcome) = self.peek() {
                return outcome;
            }
            trace!("Not done, waiting...");
            notified.await;
        }
    }
}
