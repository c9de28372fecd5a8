//! Completion handles: the event-loop side of a dispatched unit of work.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::PoolError;

/// Worker side of a [`CompletionHandle`]. Dropping it without completing
/// resolves the handle with [`PoolError::PoolClosed`].
pub struct Completer<T> {
    tx: oneshot::Sender<Result<T, PoolError>>,
}

impl<T> Completer<T> {
    /// Resolve the handle. A handle that was already dropped is ignored.
    pub fn complete(self, result: Result<T, PoolError>) {
        let _ = self.tx.send(result);
    }
}

enum HandleState<T> {
    Pending(oneshot::Receiver<Result<T, PoolError>>),
    Resolved(Option<Result<T, PoolError>>),
}

/// Future resolving to the outcome of one unit of work.
///
/// The value is delivered on whichever task awaits the handle, which for the
/// pool is the reactor's event-loop thread.
#[must_use = "a completion handle does nothing unless awaited"]
pub struct CompletionHandle<T> {
    state: HandleState<T>,
}

impl<T> CompletionHandle<T> {
    pub fn channel() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            Completer { tx },
            Self {
                state: HandleState::Pending(rx),
            },
        )
    }

    /// A handle that is already resolved with `result`.
    pub fn resolved(result: Result<T, PoolError>) -> Self {
        Self {
            state: HandleState::Resolved(Some(result)),
        }
    }

    /// Non-blocking check for a result, for callers that poll from outside
    /// an async context. Returns `None` while the work is still pending.
    pub fn try_take(&mut self) -> Option<Result<T, PoolError>> {
        match &mut self.state {
            HandleState::Resolved(result) => result.take(),
            HandleState::Pending(rx) => match rx.try_recv() {
                Ok(result) => {
                    self.state = HandleState::Resolved(None);
                    Some(result)
                }
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = HandleState::Resolved(None);
                    Some(Err(PoolError::PoolClosed))
                }
            },
        }
    }
}

impl<T> Unpin for CompletionHandle<T> {}

impl<T> Future for CompletionHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Resolved(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(PoolError::Internal(
                    "completion handle polled after resolving".to_string(),
                ))),
            },
            HandleState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(result) => {
                    this.state = HandleState::Resolved(None);
                    Poll::Ready(result.unwrap_or(Err(PoolError::PoolClosed)))
                }
            },
        }
    }
}
