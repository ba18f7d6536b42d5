//! Abort signals for pipes and writable sinks.

use super::error::StreamError;
use super::promise::WakerSet;
use crate::platform::SharedPtr;
use futures::future::{self, Either};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::task::Poll;

#[derive(Default)]
struct SignalState {
    aborted: bool,
    reason: Option<StreamError>,
}

/// Read side of an [`AbortController`].
#[derive(Clone)]
pub struct AbortSignal {
    state: SharedPtr<Mutex<SignalState>>,
    wakers: WakerSet,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            state: SharedPtr::new(Mutex::new(SignalState::default())),
            wakers: WakerSet::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// The reason passed to [`AbortController::abort`], once aborted.
    pub fn reason(&self) -> Option<StreamError> {
        self.state.lock().reason.clone()
    }

    /// Resolves with the abort reason once the signal fires.
    pub fn aborted(&self) -> impl Future<Output = Option<StreamError>> + 'static {
        let signal = self.clone();
        future::poll_fn(move |cx| {
            let state = signal.state.lock();
            if state.aborted {
                Poll::Ready(state.reason.clone())
            } else {
                signal.wakers.register(cx.waker());
                Poll::Pending
            }
        })
    }

    /// Races `fut` against the signal.
    pub fn race<F, T>(&self, fut: F) -> impl Future<Output = Result<T, StreamError>>
    where
        F: Future<Output = T>,
    {
        let aborted = Box::pin(self.aborted());
        let fut = Box::pin(fut);
        future::select(fut, aborted).map(|either| match either {
            Either::Left((value, _)) => Ok(value),
            Either::Right((reason, _)) => Err(reason.unwrap_or(StreamError::Aborted(None))),
        })
    }

    fn fire(&self, reason: Option<StreamError>) -> bool {
        {
            let mut state = self.state.lock();
            if state.aborted {
                return false;
            }
            state.aborted = true;
            state.reason = Some(reason.unwrap_or(StreamError::Aborted(None)));
        }
        self.wakers.wake_all();
        true
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Owner of an [`AbortSignal`]. Aborting is sticky: only the first reason is
/// kept.
#[derive(Clone, Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fires the signal. A missing reason is recorded as
    /// `StreamError::Aborted(None)`. Returns `false` if already aborted.
    pub fn abort(&self, reason: Option<StreamError>) -> bool {
        self.signal.fire(reason)
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn aborted_future_resolves_with_first_reason() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.aborted().await }
        });
        tokio::task::yield_now().await;

        assert!(controller.abort(Some(StreamError::type_error("stop"))));
        assert!(!controller.abort(Some(StreamError::Canceled)));

        let reason = waiter.await.unwrap();
        assert!(matches!(reason, Some(StreamError::Type(ref m)) if m == "stop"));
        assert!(signal.is_aborted());
        assert!(matches!(signal.reason(), Some(StreamError::Type(_))));
    }

    #[tokio::test]
    async fn missing_reason_becomes_aborted_error() {
        let controller = AbortController::new();
        controller.abort(None);
        let reason = controller.signal().aborted().await;
        assert!(matches!(reason, Some(StreamError::Aborted(None))));
    }

    #[tokio::test]
    async fn race_stops_slow_work() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let slow = tokio::spawn(async move {
            signal
                .race(tokio::time::sleep(Duration::from_secs(10)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort(None);
        assert!(matches!(slow.await.unwrap(), Err(StreamError::Aborted(None))));

        let fresh = AbortController::new().signal();
        assert_eq!(fresh.race(async { 5 }).await.unwrap(), 5);
        let pending = controller.signal().race(future::pending::<()>()).await;
        assert!(pending.is_err());
    }
}
