//! Per-submission completion signal and task failure types.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

/// Why a submitted task did not produce a value.
///
/// `E` is the error type returned by the task body itself. The other variants
/// describe failures the task body never got to report.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    /// The task ran and returned `Err`.
    #[error("task failed: {0}")]
    Failed(E),

    /// The task panicked while running.
    #[error("task panicked")]
    Panicked,

    /// The runtime aborted the task before it completed (e.g. during shutdown).
    #[error("task was aborted before completing")]
    Aborted,

    /// Every handle to the queue was dropped before the task reached the front.
    #[error("queue was dropped before the task ran")]
    Discarded,
}

impl<E> TaskError<E> {
    /// Returns the task's own error, if the task body returned one.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if the task was dropped without ever running.
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded)
    }

    /// Returns `true` if the task panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked)
    }
}

/// Resolves once the submitted task has finished (or will never run).
///
/// Returned by [`TaskQueue::submit`](super::TaskQueue::submit). Awaiting the
/// handle is optional: dropping it does not cancel the task, it only gives
/// up on observing the result.
///
/// # Examples
///
/// ```rust,no_run
/// use rtask::queue::TaskQueue;
///
/// # async fn demo() {
/// let queue = TaskQueue::new();
/// let handle = queue.submit(|| async { Ok::<_, std::io::Error>(21 * 2) });
/// assert_eq!(handle.await.unwrap(), 42);
/// # }
/// ```
#[must_use = "dropping a TaskHandle discards the task's result"]
pub struct TaskHandle<T, E> {
    rx: oneshot::Receiver<Result<T, TaskError<E>>>,
}

impl<T, E> TaskHandle<T, E> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, TaskError<E>>>) -> Self {
        Self { rx }
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<T, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A closed channel means the erased task was dropped unrun.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Discarded)))
    }
}
