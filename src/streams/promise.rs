//! Settle-once completion values shared between a stream's state and the
//! futures handed out to callers.

use super::error::{StreamError, StreamResult};
use crate::platform::SharedPtr;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

// ----------- WakerSet -----------
/// A set of wakers without duplicates (based on `will_wake`).
#[derive(Clone, Default, Debug)]
pub struct WakerSet(SharedPtr<Mutex<Vec<Waker>>>);

impl WakerSet {
    pub fn new() -> Self {
        Self(SharedPtr::new(Mutex::new(Vec::new())))
    }

    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub fn wake_all(&self) {
        let wakers: Vec<Waker> = self.0.lock().drain(..).collect();
        for waker in wakers {
            waker.wake();
        }
    }
}

// ----------- Deferred -----------
/// A result that is settled at most once and can be awaited by any number of
/// clones.
///
/// Later calls to [`Deferred::settle`] are ignored, so a stream can settle the
/// same `closed` or `ready` value from several code paths without tracking
/// who got there first.
pub struct Deferred<T> {
    result: SharedPtr<Mutex<Option<StreamResult<T>>>>,
    wakers: WakerSet,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            wakers: self.wakers.clone(),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            result: SharedPtr::new(Mutex::new(None)),
            wakers: WakerSet::new(),
        }
    }

    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    pub fn rejected(error: StreamError) -> Self {
        let deferred = Self::new();
        deferred.reject(error);
        deferred
    }

    /// Stores `result` unless already settled. Returns whether this call
    /// settled it.
    pub fn settle(&self, result: StreamResult<T>) -> bool {
        {
            let mut slot = self.result.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
        }
        self.wakers.wake_all();
        true
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: StreamError) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.result.lock().is_some()
    }

    pub fn is_pending(&self) -> bool {
        !self.is_settled()
    }

    /// Whether both handles settle together.
    pub fn same(&self, other: &Deferred<T>) -> bool {
        SharedPtr::ptr_eq(&self.result, &other.result)
    }
}

impl<T: Clone> Deferred<T> {
    pub fn peek(&self) -> Option<StreamResult<T>> {
        self.result.lock().clone()
    }

    pub fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<StreamResult<T>> {
        // The waker is registered under the result lock, so a concurrent
        // settle either is observed here or wakes this task afterwards.
        let slot = self.result.lock();
        match slot.as_ref() {
            Some(result) => Poll::Ready(result.clone()),
            None => {
                self.wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }

    /// A future resolving to the settled result. It may be polled again after
    /// completion and yields the same result.
    pub fn wait(&self) -> DeferredFuture<T> {
        DeferredFuture {
            deferred: self.clone(),
        }
    }
}

/// Future returned by [`Deferred::wait`].
pub struct DeferredFuture<T> {
    deferred: Deferred<T>,
}

impl<T: Clone> Future for DeferredFuture<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.deferred.poll_settled(cx)
    }
}
