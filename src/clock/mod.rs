//! Time source for the scheduler.
//!
//! [`CronScheduler`](crate::scheduler::CronScheduler) never touches the OS
//! timer directly. It asks a [`Clock`] for the current time and for one-shot
//! timers, and re-arms the next firing itself. Two clocks ship with the crate:
//!
//! | Clock           | Time source                     | Use                       |
//! |-----------------|---------------------------------|---------------------------|
//! | [`TokioClock`]  | `tokio::time` (real or paused)  | production                |
//! | [`ManualClock`] | advanced explicitly by the test | deterministic simulation  |

use std::fmt;
use std::time::Duration;

mod manual;
mod system;

pub use manual::ManualClock;
pub use system::TokioClock;

/// Work run once when a timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a timer armed with [`Clock::schedule_after`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// A monotonic time source that can run callbacks after a delay.
///
/// # Contract
///
/// - `now` never goes backwards.
/// - A callback runs at most once, no earlier than `delay` after it was armed.
/// - After `cancel` returns `true` the callback will not start. A callback that
///   has already started is not interrupted.
/// - Implementations must not hold internal locks while running a callback;
///   callbacks are allowed to arm and cancel timers on the same clock.
pub trait Clock: Send + Sync + 'static {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Arms a one-shot timer that runs `callback` after `delay`.
    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    /// Disarms a timer. Returns `false` if it already fired or was never armed.
    fn cancel(&self, timer: TimerId) -> bool;
}
