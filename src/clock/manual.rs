//! Simulated clock that only moves when told to.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Clock, TimerCallback, TimerId};

#[derive(Default)]
struct State {
    now: Duration,
    next_id: u64,
    // Keyed by (deadline, id) so equal deadlines fire in arming order.
    timers: BTreeMap<(Duration, u64), TimerCallback>,
    deadlines: HashMap<u64, Duration>,
}

/// A [`Clock`] driven entirely by [`advance`](Self::advance).
///
/// Clones share the same timeline, so a test can keep one clone while handing
/// another to the scheduler.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
/// use rtask::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let h = Arc::clone(&hits);
/// clock.schedule_after(Duration::from_millis(100), Box::new(move || {
///     h.fetch_add(1, Ordering::SeqCst);
/// }));
///
/// clock.advance(Duration::from_millis(99));
/// assert_eq!(hits.load(Ordering::SeqCst), 0);
/// clock.advance(Duration::from_millis(1));
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<State>>,
}

impl ManualClock {
    /// Creates a clock at time zero with no timers.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves time forward by `by`, running every timer that comes due.
    ///
    /// Timers run in deadline order, and `now` reads as each timer's deadline
    /// while its callback runs. Timers armed by those callbacks also run
    /// during this call if their deadline is within the window.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now.saturating_add(by);

        loop {
            let callback = {
                let mut state = self.lock();
                let Some(entry) = state.timers.first_entry() else {
                    break;
                };
                if entry.key().0 > target {
                    break;
                }
                let ((deadline, id), callback) = entry.remove_entry();
                state.deadlines.remove(&id);
                state.now = deadline;
                callback
            };
            callback();
        }

        let mut state = self.lock();
        state.now = state.now.max(target);
    }

    /// Number of armed timers.
    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.lock().now
    }

    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let deadline = state.now.saturating_add(delay);
        state.timers.insert((deadline, id), callback);
        state.deadlines.insert(id, deadline);
        TimerId::new(id)
    }

    fn cancel(&self, timer: TimerId) -> bool {
        let mut state = self.lock();
        match state.deadlines.remove(&timer.as_u64()) {
            Some(deadline) => state.timers.remove(&(deadline, timer.as_u64())).is_some(),
            None => false,
        }
    }
}
