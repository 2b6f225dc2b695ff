//! Strictly ordered, single-flight async task queue.
//!
//! A [`TaskQueue`] takes zero-argument async closures and runs them one at a
//! time, in the order they were submitted. Submission is a synchronous append;
//! the first submission on an idle queue also spawns the drain loop that works
//! through the pending sequence.
//!
//! ## Guarantees
//!
//! - **FIFO**: tasks run in submission order, including tasks submitted by a
//!   running task (those go to the back of the line like any other).
//! - **Single flight**: at most one drain loop exists per queue, so no two
//!   tasks of the same queue ever overlap.
//! - **Contained failures**: every task body runs in its own Tokio task. An
//!   `Err` or a panic is delivered to that task's [`TaskHandle`] and the queue
//!   moves on to the next task.
//!
//! ## Lifecycle
//!
//! `TaskQueue` is a cheap, cloneable handle. Once the last clone is dropped the
//! drain loop stops at the next task boundary: the task currently running is
//! allowed to finish, and every task still pending is dropped unrun. Their
//! handles resolve to [`TaskError::Discarded`].

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

mod handle;

pub use handle::{TaskError, TaskHandle};

/// Name used in log fields for queues created without an explicit name.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Errors produced while constructing a queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no Tokio runtime is available to drive the queue")]
    NoRuntime,
}

// What the drain loop learns about a finished task. The typed result has
// already been handed to the submitter by the time this is produced.
enum Outcome {
    Succeeded,
    Failed(String),
    Panicked,
    Aborted,
}

type JobFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

// A type-erased submission. Invoking it spawns the task body on `runtime` and
// returns a future that reports the outcome once the body has finished.
type Job = Box<dyn FnOnce(&Handle) -> JobFuture + Send>;

/// Point-in-time counters for a [`TaskQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting to run (excludes the one in flight).
    pub pending: usize,
    /// Whether a drain loop is currently active.
    pub draining: bool,
    /// Total tasks ever submitted.
    pub submitted: u64,
    /// Tasks that returned `Ok`.
    pub succeeded: u64,
    /// Tasks that returned `Err`, panicked, or were aborted.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct State {
    pending: VecDeque<Job>,
    draining: bool,
}

struct Inner {
    name: Arc<str>,
    runtime: Handle,
    state: Mutex<State>,
    idle: Notify,
    counters: Counters,
}

impl Inner {
    // User code never runs under this lock, so a poisoned guard still holds
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Pops the next task, or marks the queue idle when there is none. Both
    // happen under one lock so a concurrent `submit` either sees the loop as
    // still active or starts a fresh one.
    fn next_or_idle(&self) -> Option<Job> {
        let mut state = self.lock();
        let job = state.pending.pop_front();
        if job.is_none() {
            state.draining = false;
            drop(state);
            debug!(queue = %self.name, "drain loop idle");
            self.idle.notify_waiters();
        }
        job
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let pending = self.lock().pending.len();
        if pending > 0 {
            warn!(queue = %self.name, pending, "queue dropped; discarding pending tasks");
        }
    }
}

/// An in-process queue that runs async tasks one at a time in FIFO order.
///
/// # Examples
///
/// ```rust,no_run
/// use rtask::queue::TaskQueue;
///
/// #[tokio::main]
/// async fn main() {
///     let queue = TaskQueue::named("emails");
///
///     let first = queue.submit(|| async { Ok::<_, String>("sent welcome") });
///     let second = queue.submit(|| async { Err::<(), _>("smtp down".to_owned()) });
///
///     assert_eq!(first.await.unwrap(), "sent welcome");
///     assert!(second.await.is_err());
/// }
/// ```
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Creates a queue bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime. Use [`try_new`](Self::try_new)
    /// or [`with_handle`](Self::with_handle) where that is possible.
    pub fn new() -> Self {
        Self::with_handle(Handle::current(), DEFAULT_QUEUE_NAME)
    }

    /// Creates a queue with a name that is attached to its log records.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_handle(Handle::current(), name)
    }

    /// Creates a queue bound to the current Tokio runtime, if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NoRuntime`] when called outside a runtime.
    pub fn try_new() -> Result<Self, QueueError> {
        let runtime = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        Ok(Self::with_handle(runtime, DEFAULT_QUEUE_NAME))
    }

    /// Creates a queue that spawns its work on the given runtime.
    pub fn with_handle(runtime: Handle, name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                runtime,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    draining: false,
                }),
                idle: Notify::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Returns the queue's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Appends `task` to the queue and returns a handle to its result.
    ///
    /// This never waits for the task to run. If the queue was idle a drain
    /// loop is spawned; otherwise the running loop picks the task up after
    /// everything submitted before it.
    ///
    /// `task` is called at most once, at some later point, from a Tokio worker.
    pub fn submit<F, Fut, T, E>(&self, task: F) -> TaskHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let job: Job = Box::new(move |runtime: &Handle| -> JobFuture {
            // Calling `task` inside the spawned future keeps a panicking
            // closure off the drain loop as well.
            let body = runtime.spawn(async move { task().await });
            Box::pin(async move {
                let (result, outcome) = match body.await {
                    Ok(Ok(value)) => (Ok(value), Outcome::Succeeded),
                    Ok(Err(e)) => {
                        let message = e.to_string();
                        (Err(TaskError::Failed(e)), Outcome::Failed(message))
                    }
                    Err(e) if e.is_panic() => (Err(TaskError::Panicked), Outcome::Panicked),
                    Err(_) => (Err(TaskError::Aborted), Outcome::Aborted),
                };
                // The submitter may have dropped its handle; the outcome is
                // still logged by the drain loop.
                let _ = tx.send(result);
                outcome
            })
        });

        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let start_drain = {
            let mut state = self.inner.lock();
            state.pending.push_back(job);
            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            debug!(queue = %self.inner.name, "drain loop starting");
            self.inner.runtime.spawn(drain(Arc::downgrade(&self.inner)));
        }

        TaskHandle::new(rx)
    }

    /// Submits `task` and waits for its result.
    pub async fn run<F, Fut, T, E>(&self, task: F) -> Result<T, TaskError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.submit(task).await
    }

    /// Number of tasks waiting to run. The task in flight is not counted.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns `true` if no task is waiting to run.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` while a drain loop is active.
    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    /// Returns a snapshot of the queue's counters.
    pub fn stats(&self) -> QueueStats {
        let (pending, draining) = {
            let state = self.inner.lock();
            (state.pending.len(), state.draining)
        };
        let counters = &self.inner.counters;
        QueueStats {
            pending,
            draining,
            submitted: counters.submitted.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Waits until the queue has no active drain loop.
    ///
    /// Returns immediately if the queue is already idle.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.inner.idle.notified());
            // Register before checking so an idle transition in between is not missed.
            notified.as_mut().enable();
            if !self.is_draining() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("pending", &state.pending.len())
            .field("draining", &state.draining)
            .finish()
    }
}

/// The drain loop. Holds only a weak reference between tasks so that dropping
/// the last [`TaskQueue`] handle ends it.
async fn drain(queue: Weak<Inner>) {
    while let Some(inner) = queue.upgrade() {
        let Some(job) = inner.next_or_idle() else {
            return;
        };
        let name = Arc::clone(&inner.name);
        let runtime = inner.runtime.clone();
        drop(inner);

        let outcome = job(&runtime).await;

        match &outcome {
            Outcome::Succeeded => debug!(queue = %name, "task completed"),
            Outcome::Failed(error) => warn!(queue = %name, error = %error, "task failed"),
            Outcome::Panicked => warn!(queue = %name, "task panicked"),
            Outcome::Aborted => warn!(queue = %name, "task aborted by the runtime"),
        }

        if let Some(inner) = queue.upgrade() {
            inner.counters.record(&outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    type Log = Arc<Mutex<Vec<&'static str>>>;
    type TestFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

    fn make_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<&'static str> {
        log.lock().unwrap().clone()
    }

    // Task that sleeps for `delay_ms` and then records `label`.
    fn delayed(
        log: &Log,
        label: &'static str,
        delay_ms: u64,
    ) -> impl FnOnce() -> TestFuture + Send + 'static {
        let log = Arc::clone(log);
        move || -> TestFuture {
            Box::pin(async move {
                sleep(Duration::from_millis(delay_ms)).await;
                log.lock().unwrap().push(label);
                Ok(())
            })
        }
    }

    // ── Ordering ──────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_in_submission_order() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = Arc::clone(&order);
            let _ = queue.submit(move || async move {
                order.lock().unwrap().push(i);
                Ok::<_, String>(())
            });
        }

        queue.wait_idle().await;
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_delays_do_not_reorder_tasks() {
        let queue = TaskQueue::new();
        let log = make_log();

        let a = queue.submit(delayed(&log, "A", 300));
        let b = queue.submit(delayed(&log, "B", 100));
        let c = queue.submit(delayed(&log, "C", 200));

        c.await.unwrap();
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(entries(&log), vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn task_submitted_while_running_goes_to_the_back() {
        let queue = TaskQueue::new();
        let log = make_log();

        let reentrant = {
            let queue = queue.clone();
            let log = Arc::clone(&log);
            move || async move {
                let _ = queue.submit(delayed(&log, "D", 1));
                sleep(Duration::from_millis(50)).await;
                log.lock().unwrap().push("A");
                Ok::<_, String>(())
            }
        };

        let _ = queue.submit(reentrant);
        let _ = queue.submit(delayed(&log, "B", 10));
        let _ = queue.submit(delayed(&log, "C", 10));

        queue.wait_idle().await;
        assert_eq!(entries(&log), vec!["A", "B", "C", "D"]);
    }

    // ── Single flight ─────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn never_runs_two_tasks_at_once() {
        let queue = TaskQueue::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..20u64 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let _ = queue.submit(move || async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20 - i)).await;
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(())
            });
        }

        queue.wait_idle().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().succeeded, 20);
    }

    #[tokio::test]
    async fn submit_returns_before_the_task_runs() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let handle = {
            let ran = Arc::clone(&ran);
            queue.submit(move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
        };

        // The current-thread runtime has not polled the drain loop yet.
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(queue.is_draining());
        assert_eq!(queue.len(), 1);

        handle.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    // ── Failures ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_task_is_reported_and_queue_continues() {
        let queue = TaskQueue::new();

        let failing = queue.submit(|| async { Err::<u32, _>("boom".to_owned()) });
        let healthy = queue.submit(|| async { Ok::<_, String>(2) });

        match failing.await {
            Err(TaskError::Failed(e)) => assert_eq!(e, "boom"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(healthy.await.unwrap(), 2);

        queue.wait_idle().await;
        let stats = queue.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_the_queue() {
        let queue = TaskQueue::new();

        let panicking = queue.submit(|| async {
            if true {
                panic!("task blew up");
            }
            Ok::<(), String>(())
        });
        let after = queue.submit(|| async { Ok::<_, String>("still running") });

        assert!(panicking.await.unwrap_err().is_panic());
        assert_eq!(after.await.unwrap(), "still running");
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel_the_task() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = Arc::clone(&ran);
            let _ = queue.submit(move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            });
        }

        queue.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn dropping_the_queue_discards_pending_tasks() {
        let queue = TaskQueue::new();
        let (started_tx, started_rx) = oneshot::channel();

        let running = queue.submit(move || async move {
            let _ = started_tx.send(());
            sleep(Duration::from_millis(100)).await;
            Ok::<_, String>("finished")
        });
        let second = queue.submit(|| async { Ok::<_, String>("never") });
        let third = queue.submit(|| async { Ok::<_, String>("never") });

        started_rx.await.unwrap();
        drop(queue);

        assert_eq!(running.await.unwrap(), "finished");
        assert!(second.await.unwrap_err().is_discarded());
        assert!(third.await.unwrap_err().is_discarded());
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_on_fresh_queue() {
        let queue = TaskQueue::named("fresh");
        queue.wait_idle().await;
        assert!(!queue.is_draining());
        assert!(queue.is_empty());
        assert_eq!(queue.name(), "fresh");
    }

    #[tokio::test]
    async fn queue_restarts_after_going_idle() {
        let queue = TaskQueue::new();

        assert_eq!(queue.run(|| async { Ok::<_, String>(1) }).await.unwrap(), 1);
        queue.wait_idle().await;
        assert!(!queue.is_draining());

        assert_eq!(queue.run(|| async { Ok::<_, String>(2) }).await.unwrap(), 2);
        assert_eq!(queue.stats().submitted, 2);
    }

    #[test]
    fn try_new_outside_runtime_fails() {
        assert!(matches!(TaskQueue::try_new(), Err(QueueError::NoRuntime)));
    }

    #[tokio::test]
    async fn stats_serialize_to_json() {
        let queue = TaskQueue::new();
        queue.run(|| async { Ok::<_, String>(()) }).await.unwrap();
        queue.wait_idle().await;

        let json = serde_json::to_value(queue.stats()).unwrap();
        assert_eq!(json["submitted"], 1);
        assert_eq!(json["succeeded"], 1);
        assert_eq!(json["draining"], false);
    }
}
