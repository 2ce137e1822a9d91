use core::borrow::Borrow;
use core::fmt;
use core::future::Future;
use core::hash::Hash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, instrument, trace, warn};

use crate::call::{Call, Outcome, Status};

type Registry<T, E, K> = Mutex<HashMap<K, Arc<Call<T, E>>>>;

/// Group represents a class of work and creates a space in which units of work
/// can be executed with duplicate suppression.
///
/// A `Group` is a handle: clones share the same set of in-flight calls, so one
/// group can be handed to every thread or task that should deduplicate
/// against the others. Independent groups never see each other's keys.
pub struct Group<T, E, K = String>(Arc<Registry<T, E, K>>);

enum Admission<'g, T, E, K: Hash + Eq> {
    Leader(Flight<'g, T, E, K>),
    Waiter(Arc<Call<T, E>>),
}

/// Leadership over one key-generation.
///
/// Landing it publishes the result. Dropping it unlanded (the work panicked,
/// or the leader's future was dropped) publishes `LeaderDrop` so waiters are
/// not left parked forever.
struct Flight<'g, T, E, K: Hash + Eq> {
    group: &'g Group<T, E, K>,
    key: Option<K>,
    call: Arc<Call<T, E>>,
}

impl<T, E, K: Hash + Eq> Flight<'_, T, E, K> {
    fn land(mut self, result: Result<T, E>) -> bool {
        match self.key.take() {
            Some(key) => self.group.retire(&key, &self.call, Status::Done(result)),
            None => unreachable!("flight landed twice"),
        }
    }
}

impl<T, E, K: Hash + Eq> Drop for Flight<'_, T, E, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            warn!("Leader dropped before completing, releasing waiters");
            self.group.retire(&key, &self.call, Status::LeaderDrop);
        }
    }
}

impl<T, E, K> Group<T, E, K> {
    pub fn new() -> Self {
        Group(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl<T, E, K> Default for Group<T, E, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E, K> Clone for Group<T, E, K> {
    fn clone(&self) -> Self {
        Group(self.0.clone())
    }
}

impl<T, E, K> fmt::Debug for Group<T, E, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.0.lock().len())
            .finish()
    }
}

impl<T, E, K: Hash + Eq> Group<T, E, K> {
    /// Number of keys with an execution currently in flight.
    pub fn in_flight(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether an execution for `key` is currently in flight.
    pub fn is_in_flight<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.0.lock().contains_key(key)
    }

    /// Settles `call` and removes it from the registry in one critical
    /// section, so no caller can find a settled call still registered.
    /// Returns whether any duplicate joined the call.
    fn retire(&self, key: &K, call: &Arc<Call<T, E>>, status: Status<T, E>) -> bool {
        let mut map = self.0.lock();
        call.settle(status);
        // Admission never replaces a registered call, so the entry must
        // still be ours. Anything else is a bookkeeping bug, and the
        // foreign entry is left alone.
        let ours = matches!(map.get(key), Some(current) if Arc::ptr_eq(current, call));
        debug_assert!(ours, "in-flight entry replaced before retirement");
        if ours {
            map.remove(key);
            trace!("Entry removed");
        } else {
            error!("In-flight entry replaced before retirement");
        }
        call.has_dups()
    }
}

impl<T, E, K> Group<T, E, K>
where
    T: Clone,
    E: Clone,
    K: Hash + Eq,
{
    fn admit<Q>(&self, key: &Q) -> Admission<'_, T, E, K>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let mut map = self.0.lock();
        trace!("Acquire registry lock");
        if let Some(call) = map.get(key) {
            call.add_dup();
            trace!("Joining in-flight call");
            return Admission::Waiter(call.clone());
        }
        let call = Arc::new(Call::new());
        map.insert(key.to_owned(), call.clone());
        drop(map);

        trace!("Entry inited, leading");
        Admission::Leader(Flight {
            group: self,
            key: Some(key.to_owned()),
            call,
        })
    }

    /// work executes and returns the results of the given function, making
    /// sure that only one execution is in-flight for a given key at a
    /// time. If a duplicate comes in, the duplicate caller waits for the
    /// original to complete and receives the same results.
    ///
    /// The error is handed back untouched, to the leader and to every
    /// duplicate alike. Once the execution completes the key is forgotten,
    /// so the next call runs `work` again.
    pub fn work<Q, F>(&self, key: &Q, work: F) -> Result<T, E>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + fmt::Debug + ?Sized,
        F: FnOnce() -> Result<T, E>,
    {
        self.work_shared(key, work).0
    }

    /// Like `work`, also reporting whether the result was given to more
    /// than one caller.
    #[instrument(skip(self, work))]
    pub fn work_shared<Q, F>(&self, key: &Q, work: F) -> (Result<T, E>, bool)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + fmt::Debug + ?Sized,
        F: FnOnce() -> Result<T, E>,
    {
        loop {
            let flight = match self.admit(key) {
                Admission::Leader(flight) => flight,
                Admission::Waiter(call) => match call.wait() {
                    Outcome::Settled(result) => {
                        trace!("Value returned");
                        return (result, true);
                    }
                    Outcome::Abandoned => {
                        trace!("Leader dropped, retrying");
                        continue;
                    }
                },
            };

            trace!("working...");
            let result = work();
            let shared = flight.land(result.clone());
            trace!("Work done");
            return (result, shared);
        }
    }

    /// async_work is like work but awaits the given future, and duplicates
    /// wait without blocking their thread.
    ///
    /// Blocking and async callers of the same key join the same execution.
    pub async fn async_work<Q, Fut>(&self, key: &Q, fut: Fut) -> Result<T, E>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + fmt::Debug + ?Sized,
        Fut: Future<Output = Result<T, E>>,
    {
        self.async_work_shared(key, fut).await.0
    }

    #[instrument(skip(self, fut))]
    pub async fn async_work_shared<Q, Fut>(&self, key: &Q, fut: Fut) -> (Result<T, E>, bool)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + fmt::Debug + ?Sized,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            let flight = match self.admit(key) {
                Admission::Leader(flight) => flight,
                Admission::Waiter(call) => match call.wait_async().await {
                    Outcome::Settled(result) => {
                        trace!("Value returned");
                        return (result, true);
                    }
                    Outcome::Abandoned => {
                        trace!("Leader dropped, retrying");
                        continue;
                    }
                },
            };

            trace!("working...");
            let result = fut.await;
            let shared = flight.land(result.clone());
            trace!("Work done");
            return (result, shared);
        }
    }
}
