//! Caller-side handle for one dispatched operation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::PluginError;

/// Resolves once with the outcome of a controller operation.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited or waited on"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, PluginError>>,
}

impl<T> Completion<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T, PluginError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the current thread until the outcome arrives.
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// `.await` there.
    pub fn wait(self) -> Result<T, PluginError> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// The outcome, if it has already arrived.
    pub fn try_take(&mut self) -> Option<Result<T, PluginError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, PluginError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> PluginError {
    PluginError::transport("completion dropped without an outcome")
}
