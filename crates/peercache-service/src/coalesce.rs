//! Request coalescing for concurrent loads of the same key.
//!
//! A [`Coalescer`] makes sure that at most one call per key is in flight at any time. The first
//! caller for a key becomes the *leader* and awaits the provided future inline, on the task that
//! called [`Coalescer::run`]. Every other caller that arrives while the leader is still running
//! attaches to the in-flight call and gets a clone of the leader's result once it resolves.
//!
//! The key map is only locked for bookkeeping, never while the call itself runs, so slow loads do
//! not hold up unrelated keys.
//!
//! The in-flight record is removed on every exit path of the leader: normal completion, a panic
//! inside the call, or the leader's future being dropped mid-flight. A panic is handed to all
//! waiters as a [`CallFault`]. When the leader is dropped, the waiters have not lost anything but
//! their leader, so one of them takes over and runs the call instead.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;

/// An abnormal end of an in-flight call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFault {
    /// The call panicked. Contains the panic message if it was a string.
    #[error("in-flight call panicked: {0}")]
    Panicked(String),
}

impl CallFault {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self::Panicked(message)
    }
}

/// How an in-flight call ended.
#[derive(Clone)]
enum Outcome<T> {
    Done(Result<T, CallFault>),
    /// The leader was dropped before the call completed.
    Abandoned,
}

/// The resolution slot of an in-flight call. `None` until the leader is done.
type Slot<T> = Option<Outcome<T>>;

type Calls<K, T> = Mutex<HashMap<K, watch::Receiver<Slot<T>>>>;

/// The outcome of [`Coalescer::run`].
#[derive(Debug, Clone)]
pub struct Coalesced<T> {
    /// The result of the single call that ran for this key.
    pub result: Result<T, CallFault>,
    /// `true` if this caller attached to a call started by someone else.
    pub shared: bool,
}

/// Deduplicates concurrent calls by key.
pub struct Coalescer<K, T> {
    calls: Calls<K, T>,
}

impl<K, T> fmt::Debug for Coalescer<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.calls.try_lock().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("Coalescer")
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<K, T> Default for Coalescer<K, T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Slot<T>>),
    Waiter(watch::Receiver<Slot<T>>),
}

impl<K, T> Coalescer<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Runs `f` for `key`, unless a call for `key` is already in flight.
    ///
    /// If no call is in flight, `f` is invoked and awaited on the current task and its output is
    /// handed to all callers that attached in the meantime. Otherwise this waits for the in-flight
    /// call to resolve, and `f` is dropped without being called.
    ///
    /// If the caller running the in-flight call is dropped before it completes, one of the waiting
    /// callers takes over and runs its own `f`. The others attach to that new call.
    ///
    /// Results are not kept beyond the lifetime of the call: once it resolved, the next `run` for
    /// the same key starts a new call.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> Coalesced<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let sender = loop {
            let role = {
                let mut calls = lock(&self.calls);
                match calls.get(&key) {
                    Some(receiver) => Role::Waiter(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        calls.insert(key.clone(), receiver);
                        Role::Leader(sender)
                    }
                }
            };

            match role {
                Role::Leader(sender) => break sender,
                Role::Waiter(receiver) => match wait(receiver).await {
                    Outcome::Done(result) => {
                        return Coalesced {
                            result,
                            shared: true,
                        };
                    }
                    Outcome::Abandoned => {
                        tracing::debug!("Taking over an abandoned in-flight call");
                    }
                },
            }
        };

        let mut in_flight = InFlight {
            calls: &self.calls,
            key,
            sender,
            released: false,
        };

        let result = AssertUnwindSafe(async move { f().await })
            .catch_unwind()
            .await
            .map_err(CallFault::from_panic);

        in_flight.release(Outcome::Done(result.clone()));

        Coalesced {
            result,
            shared: false,
        }
    }
}

fn lock<K, T>(calls: &Calls<K, T>) -> MutexGuard<'_, HashMap<K, watch::Receiver<Slot<T>>>> {
    // The map is never left half-updated, so a poisoned lock is still consistent.
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait<T: Clone>(mut receiver: watch::Receiver<Slot<T>>) -> Outcome<T> {
    let outcome = match receiver.wait_for(Option::is_some).await {
        Ok(slot) => (*slot).clone().unwrap_or(Outcome::Abandoned),
        Err(_) => Outcome::Abandoned,
    };
    outcome
}

/// The leader's handle on its in-flight record.
///
/// Dropping it without calling [`release`](Self::release) tells all waiters that the call was
/// abandoned, so that one of them can take over.
struct InFlight<'a, K: Eq + Hash, T> {
    calls: &'a Calls<K, T>,
    key: K,
    sender: watch::Sender<Slot<T>>,
    released: bool,
}

impl<K: Eq + Hash, T> InFlight<'_, K, T> {
    fn release(&mut self, outcome: Outcome<T>) {
        // Free the key first, so callers arriving from now on start a fresh call instead of
        // picking up this result.
        lock(self.calls).remove(&self.key);
        self.sender.send_replace(Some(outcome));
        self.released = true;
    }
}

impl<K: Eq + Hash, T> Drop for InFlight<'_, K, T> {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                waiters = self.sender.receiver_count().saturating_sub(1),
                "In-flight call dropped before completion"
            );
            self.release(Outcome::Abandoned);
        }
    }
}
