//! Clock backed by the Tokio timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::trace;

use super::{Clock, TimerCallback, TimerId};

struct Inner {
    origin: Instant,
    runtime: Handle,
    next_id: AtomicU64,
    timers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl Inner {
    fn timers(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Deregisters an expired timer. `false` means `cancel` got there first and
    // the callback must not run.
    fn claim(&self, id: u64) -> bool {
        self.timers().remove(&id).is_some()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, timer) in self.timers().drain() {
            timer.abort();
        }
    }
}

/// A [`Clock`] that arms each timer as a sleeping Tokio task.
///
/// Time is read from [`tokio::time::Instant`], so under
/// `#[tokio::test(start_paused = true)]` the clock follows Tokio's paused,
/// auto-advancing time. Dropping the last clone aborts every armed timer.
#[derive(Clone)]
pub struct TokioClock {
    inner: Arc<Inner>,
}

impl TokioClock {
    /// Creates a clock that spawns its timers on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    /// Creates a clock that spawns its timers on `runtime`.
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                origin: Instant::now(),
                runtime,
                next_id: AtomicU64::new(0),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.inner.origin.elapsed()
    }

    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let clock = Arc::downgrade(&self.inner);

        // Hold the table while spawning so the timer cannot finish and try to
        // deregister itself before it has been registered.
        let mut timers = self.inner.timers();
        let timer = self.inner.runtime.spawn(async move {
            sleep(delay).await;
            let Some(inner) = clock.upgrade() else {
                return;
            };
            if !inner.claim(id) {
                return;
            }
            drop(inner);
            trace!(timer = id, "timer fired");
            callback();
        });
        timers.insert(id, timer);

        TimerId::new(id)
    }

    fn cancel(&self, timer: TimerId) -> bool {
        match self.inner.timers().remove(&timer.as_u64()) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}
