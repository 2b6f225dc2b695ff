//! Registry entries for scheduled jobs.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::clock::TimerId;

/// A job callback with its error type erased to a message.
pub(crate) type JobCallback = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

pub(crate) struct ScheduledJob {
    // Distinguishes this registration from earlier ones under the same name.
    pub(crate) generation: u64,
    pub(crate) interval: Duration,
    pub(crate) callback: JobCallback,
    pub(crate) timer: TimerId,
    pub(crate) next_fire: Duration,
    pub(crate) fires: u64,
    pub(crate) failures: u64,
}

impl ScheduledJob {
    pub(crate) fn info(&self, name: &str) -> JobInfo {
        JobInfo {
            name: name.to_owned(),
            interval: self.interval,
            next_fire: self.next_fire,
            fires: self.fires,
            failures: self.failures,
        }
    }
}

/// Snapshot of one active job, as reported by
/// [`CronScheduler::jobs`](super::CronScheduler::jobs).
///
/// Durations serialize as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub name: String,
    #[serde(rename = "interval_ms", serialize_with = "as_millis")]
    pub interval: Duration,
    /// Clock time of the next firing.
    #[serde(rename = "next_fire_ms", serialize_with = "as_millis")]
    pub next_fire: Duration,
    /// Firings so far, including failed ones.
    pub fires: u64,
    /// Firings whose callback returned `Err` or panicked.
    pub failures: u64,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
