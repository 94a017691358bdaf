use core::borrow::Borrow;
use core::future::Future;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt as _;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{error, instrument, trace, warn};

use crate::{panic_message, Error, Outcome, Result};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct Key(Arc<str>);

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One in-flight call. Never reused once completed.
#[derive(Debug)]
struct Call<T> {
    waiters: AtomicUsize,
    /// Written once, while the group's map lock is held.
    result: Mutex<Option<Result<T>>>,
    cvar: Condvar,
    notify: Notify,
    /// Only touched under the group's map lock.
    forgotten: AtomicBool,
}

impl<T> Call<T> {
    fn new() -> Self {
        Call {
            waiters: AtomicUsize::new(1),
            result: Mutex::new(None),
            cvar: Condvar::new(),
            notify: Notify::new(),
            forgotten: AtomicBool::new(false),
        }
    }
}

impl<T: Clone> Call<T> {
    fn wait(&self) -> Result<T> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.cvar.wait(&mut slot);
        }
    }

    fn wait_until(&self, deadline: Instant) -> Option<Result<T>> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return Some(result.clone());
            }
            if self.cvar.wait_until(&mut slot, deadline).timed_out() {
                return slot.clone();
            }
        }
    }

    async fn wait_async(&self) -> Result<T> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            let ready = self.result.lock().clone();
            if let Some(result) = ready {
                return result;
            }
            notified.await;
        }
    }
}

struct Inner<T> {
    calls: Mutex<HashMap<Key, Arc<Call<T>>>>,
    executions: AtomicU64,
}

/// Group represents a class of work and creates a space in which units of work
/// can be executed with duplicate suppression.
///
/// Cloning a `Group` yields another handle onto the same set of in-flight
/// calls.
///
/// # Cancellation
///
/// A joining caller that gives up (a [`work_timeout`](Self::work_timeout)
/// expiring, or an [`async_work`](Self::async_work) future being dropped)
/// only stops its own wait. The caller running the work is different: its
/// work is the call everyone else is waiting on, so if that caller is dropped
/// mid-flight the whole call fails with [`Error::LeaderDropped`]. No other
/// waiter is promoted to take over.
pub struct Group<T>(Arc<Inner<T>>);

impl<T> Clone for Group<T> {
    fn clone(&self) -> Self {
        Group(Arc::clone(&self.0))
    }
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Group(Arc::new(Inner {
            calls: Mutex::new(HashMap::new()),
            executions: AtomicU64::new(0),
        }))
    }
}

impl<T> std::fmt::Debug for Group<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.in_flight())
            .field("executions", &self.executions())
            .finish()
    }
}

enum Role<'a, T> {
    Leader(Flight<'a, T>),
    Waiter(Arc<Call<T>>),
}

/// Held by the caller running the work. Retires the call on drop if the
/// caller never got to [`Flight::finish`].
struct Flight<'a, T> {
    group: &'a Group<T>,
    key: Key,
    call: Arc<Call<T>>,
    finished: bool,
}

impl<T: Clone> Flight<'_, T> {
    fn finish(mut self, result: Result<T>) -> Result<T> {
        self.finished = true;
        self.group.complete(&self.key, &self.call, result.clone());
        result
    }
}

impl<T> Drop for Flight<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(key = %self.key.0, "leader dropped before completing");
            let err = Error::LeaderDropped(self.key.0.to_string());
            self.group.complete(&self.key, &self.call, Err(err));
        }
    }
}

/// Releases an async waiter's slot if its future is dropped while waiting.
struct Waiting<'a, T> {
    call: &'a Call<T>,
    done: bool,
}

impl<T> Drop for Waiting<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.call.waiters.fetch_sub(1, Ordering::Relaxed);
            trace!("waiter dropped");
        }
    }
}

impl<T> Group<T> {
    pub fn new() -> Group<T> {
        Self::default()
    }

    /// Number of callers attached to the in-flight call for `key`, the one
    /// running the work included. Zero when the key is idle.
    pub fn waiters(&self, key: &str) -> usize {
        self.0
            .calls
            .lock()
            .get(key)
            .map_or(0, |call| call.waiters.load(Ordering::Relaxed))
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.0.calls.lock().len()
    }

    /// How many times a work function has actually been started. Joining
    /// callers do not count.
    pub fn executions(&self) -> u64 {
        self.0.executions.load(Ordering::Relaxed)
    }

    /// Detach the in-flight call for `key`, if any. Callers already waiting
    /// on it still get its result, but the next caller for `key` starts a new
    /// call even while the old one is running.
    #[instrument(skip(self))]
    pub fn forget(&self, key: &str) {
        let mut calls = self.0.calls.lock();
        if let Some(call) = calls.remove(key) {
            call.forgotten.store(true, Ordering::Relaxed);
            trace!("entry forgotten");
        }
    }

    fn join_or_lead(&self, key: &str) -> Role<'_, T> {
        let mut calls = self.0.calls.lock();
        if let Some(call) = calls.get(key) {
            let waiters = call.waiters.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(waiters, "joining in-flight call");
            return Role::Waiter(Arc::clone(call));
        }

        let key = Key(Arc::from(key));
        let call = Arc::new(Call::new());
        calls.insert(key.clone(), Arc::clone(&call));
        drop(calls);

        self.0.executions.fetch_add(1, Ordering::Relaxed);
        trace!("leading new call");
        Role::Leader(Flight {
            group: self,
            key,
            call,
            finished: false,
        })
    }

    /// Publish `result` and wake everyone. The entry leaves the map before
    /// the result becomes visible, so a caller arriving afterwards can only
    /// start a new call.
    fn complete(&self, key: &Key, call: &Call<T>, result: Result<T>) {
        let mut calls = self.0.calls.lock();
        if !call.forgotten.load(Ordering::Relaxed) {
            calls.remove(key);
            trace!("entry removed");
        }
        *call.result.lock() = Some(result);
        drop(calls);

        call.cvar.notify_all();
        call.notify.notify_waiters();
    }
}

impl<T: Clone> Group<T> {
    /// work executes and returns the results of the given function, making
    /// sure that only one execution is in-flight for a given key at a
    /// time. If a duplicate comes in, the duplicate caller waits for the
    /// original to complete and receives the same results.
    ///
    /// A panic inside `work` is caught and reported to every caller as
    /// [`Error::Panicked`].
    #[instrument(skip(self, work))]
    pub fn work<E, F>(&self, key: &str, work: F) -> Outcome<T>
    where
        E: Into<anyhow::Error>,
        F: FnOnce() -> core::result::Result<T, E>,
    {
        match self.join_or_lead(key) {
            Role::Waiter(call) => {
                trace!("waiting for leader");
                Outcome::joined(call.wait())
            }
            Role::Leader(flight) => Outcome::leader(flight.finish(run(key, work))),
        }
    }

    /// Like [`work`](Self::work), except a caller that joins an in-flight
    /// call stops waiting after `timeout` and gets [`Error::Cancelled`].
    ///
    /// The caller that ends up running `work` is not bounded by `timeout`.
    /// A `timeout` too large to express as a deadline waits without bound.
    #[instrument(skip(self, work))]
    pub fn work_timeout<E, F>(&self, key: &str, timeout: Duration, work: F) -> Outcome<T>
    where
        E: Into<anyhow::Error>,
        F: FnOnce() -> core::result::Result<T, E>,
    {
        match self.join_or_lead(key) {
            Role::Waiter(call) => {
                let Some(deadline) = Instant::now().checked_add(timeout) else {
                    trace!("waiting for leader");
                    return Outcome::joined(call.wait());
                };
                let result = call
                    .wait_until(deadline)
                    .unwrap_or_else(|| {
                        call.waiters.fetch_sub(1, Ordering::Relaxed);
                        trace!("gave up waiting");
                        Err(Error::Cancelled(key.to_owned()))
                    });
                Outcome::joined(result)
            }
            Role::Leader(flight) => Outcome::leader(flight.finish(run(key, work))),
        }
    }

    /// async_work is like work but the work is a future produced by `work`.
    ///
    /// Dropping the returned future cancels this caller. For a joining caller
    /// that only abandons its own wait; for the caller running the work it
    /// fails the call for every waiter with [`Error::LeaderDropped`].
    #[instrument(skip(self, work))]
    pub async fn async_work<E, F, Fut>(&self, key: &str, work: F) -> Outcome<T>
    where
        E: Into<anyhow::Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = core::result::Result<T, E>>,
    {
        match self.join_or_lead(key) {
            Role::Waiter(call) => {
                let mut waiting = Waiting {
                    call: &call,
                    done: false,
                };
                trace!("waiting for leader");
                let result = call.wait_async().await;
                waiting.done = true;
                Outcome::joined(result)
            }
            Role::Leader(flight) => {
                trace!("working...");
                let fut = async move { work().await };
                let result = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(Error::Work(Arc::new(e.into()))),
                    Err(payload) => Err(panicked(key, &*payload)),
                };
                trace!("Work done");
                Outcome::leader(flight.finish(result))
            }
        }
    }
}

fn run<T, E, F>(key: &str, work: F) -> Result<T>
where
    E: Into<anyhow::Error>,
    F: FnOnce() -> core::result::Result<T, E>,
{
    trace!("working...");
    let result = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Work(Arc::new(e.into()))),
        Err(payload) => Err(panicked(key, &*payload)),
    };
    trace!("Work done");
    result
}

fn panicked(key: &str, payload: &(dyn core::any::Any + Send)) -> Error {
    let message = panic_message(payload);
    error!(%message, "work panicked");
    Error::Panicked {
        key: key.to_owned(),
        message,
    }
}
