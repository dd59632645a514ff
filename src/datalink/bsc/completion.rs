//! Per-operation completion
//!
//! A single-use promise shared between the event loop, which completes an
//! operation, and the caller waiting for it. The waiting side can either
//! block with a deadline or be awaited as a future, so the blocking API and
//! the async API wait on the same object.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use super::error::{Result, WebsocketError};

struct Slot<T> {
    value: Option<Result<T>>,
    /// Set once a result has been stored; the value may already be taken
    done: bool,
    /// The waiting side was dropped
    abandoned: bool,
    waker: Option<Waker>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a linked completer/completion pair
pub(crate) fn channel<T>() -> (Completer<T>, Completion<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            value: None,
            done: false,
            abandoned: false,
            waker: None,
        }),
        cond: Condvar::new(),
    });
    (
        Completer {
            shared: Some(shared.clone()),
        },
        Completion { shared },
    )
}

/// Completing side, held by a queued operation
///
/// Dropping it without calling [`Completer::complete`] completes the
/// operation with [`WebsocketError::Closed`], so no waiter is left blocked.
pub(crate) struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, result: Result<T>) {
        if let Some(shared) = self.shared.take() {
            Self::store(&shared, result);
        }
    }

    /// Whether nobody is waiting for the result anymore
    pub(crate) fn is_abandoned(&self) -> bool {
        self.shared.as_ref().map_or(true, |s| s.lock().abandoned)
    }

    /// Whether `completion` is the other half of this completer
    pub(crate) fn is_for(&self, completion: &Completion<T>) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, &completion.shared))
    }

    fn store(shared: &Shared<T>, result: Result<T>) {
        let mut slot = shared.lock();
        if slot.done {
            return;
        }
        slot.value = Some(result);
        slot.done = true;
        let waker = slot.waker.take();
        drop(slot);
        shared.cond.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            Self::store(&shared, Err(WebsocketError::Closed));
        }
    }
}

/// Waiting side of an operation
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completion<T> {
    /// Block until completed or until `deadline`
    ///
    /// Returns `None` if the deadline passed first. The result can only be
    /// taken once.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Option<Result<T>> {
        let mut slot = self.shared.lock();
        loop {
            if slot.done {
                return slot.value.take();
            }
            match deadline {
                None => {
                    slot = self
                        .shared
                        .cond
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    slot = self
                        .shared
                        .cond
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Take the result if the operation has completed
    pub(crate) fn try_take(&self) -> Option<Result<T>> {
        self.shared.lock().value.take()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.lock();
        if slot.done {
            return Poll::Ready(slot.value.take().unwrap_or(Err(WebsocketError::Closed)));
        }
        match &slot.waker {
            Some(w) if w.will_wake(cx.waker()) => {}
            _ => slot.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.shared.lock().abandoned = true;
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}
