//! Named, fixed-interval repeating jobs.
//!
//! A [`CronScheduler`] keeps a registry of jobs keyed by name. Each job fires
//! its callback every `interval` until it is cancelled, replaced, or the
//! scheduler shuts down. Timers come from a [`Clock`], so the same scheduler
//! runs on [`TokioClock`](crate::clock::TokioClock) in production and on
//! [`ManualClock`](crate::clock::ManualClock) in tests.
//!
//! ## Name collisions
//!
//! [`schedule`](CronScheduler::schedule) refuses a name that is already active
//! and returns [`SchedulerError::DuplicateJob`]. Replacing a job is a separate,
//! explicit operation: [`reschedule`](CronScheduler::reschedule).
//!
//! ## Cadence
//!
//! Firing `k` of a job is due at `registered_at + k * interval`. The next
//! deadline is computed from the previous deadline, not from when the callback
//! finished, so a slow callback does not make the schedule drift. Firings are
//! not serialized: a callback that spawns long-running work can overlap with
//! its own next firing. Use [`schedule_queued`](CronScheduler::schedule_queued)
//! to funnel each firing through a [`TaskQueue`] instead.
//!
//! ## Failures
//!
//! The next firing is armed before the callback runs. A callback that returns
//! `Err` or panics is logged and counted, and the job keeps firing.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, TimerId};
use crate::config::JobSpec;
use crate::queue::TaskQueue;

mod job;

pub use job::JobInfo;
use job::{JobCallback, ScheduledJob};

/// Errors produced when registering a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("a job named `{0}` is already scheduled")]
    DuplicateJob(String),

    #[error("job `{name}` needs a non-zero interval")]
    ZeroInterval { name: String },

    #[error("scheduler has been shut down")]
    ShutDown,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<String, ScheduledJob>,
    next_generation: u64,
    shut_down: bool,
}

struct Inner<C> {
    clock: C,
    registry: Mutex<Registry>,
}

impl<C: Clock> Inner<C> {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registry of named jobs, each firing at its own fixed interval.
///
/// Not `Clone`: the scheduler has a single owner, and dropping it cancels
/// every job. Share it by reference (or behind an `Arc`).
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use rtask::clock::TokioClock;
/// use rtask::scheduler::CronScheduler;
///
/// #[tokio::main]
/// async fn main() {
///     let scheduler = CronScheduler::new(TokioClock::new());
///     scheduler
///         .schedule("heartbeat", Duration::from_secs(30), || {
///             println!("still alive");
///             Ok::<_, std::convert::Infallible>(())
///         })
///         .unwrap();
///
///     tokio::time::sleep(Duration::from_secs(95)).await;
///     scheduler.cancel("heartbeat");
/// }
/// ```
pub struct CronScheduler<C: Clock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> CronScheduler<C> {
    /// Creates an empty scheduler on `clock`.
    pub fn new(clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// The clock this scheduler reads time from.
    pub fn clock(&self) -> &C {
        &self.inner.clock
    }

    /// Registers `task` to run every `interval`, starting one interval from now.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::ZeroInterval`] if `interval` is zero.
    /// - [`SchedulerError::DuplicateJob`] if a job with this name is active.
    ///   The existing job is left untouched.
    /// - [`SchedulerError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn schedule<F, E>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        task: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let name = name.into();
        check_interval(&name, interval)?;

        let mut registry = self.inner.lock();
        if registry.shut_down {
            return Err(SchedulerError::ShutDown);
        }
        if registry.jobs.contains_key(&name) {
            return Err(SchedulerError::DuplicateJob(name));
        }
        register(&self.inner, &mut registry, name, interval, erase(task));
        Ok(())
    }

    /// Registers `task` under `name`, replacing any active job with that name.
    ///
    /// The old job's timer is cancelled before the new job is registered, and
    /// the new job's first firing is one `interval` from now. Returns `true`
    /// if a job was replaced.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ZeroInterval`] or [`SchedulerError::ShutDown`]; in
    /// either case the existing job, if any, keeps running.
    pub fn reschedule<F, E>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        task: F,
    ) -> Result<bool, SchedulerError>
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let name = name.into();
        check_interval(&name, interval)?;

        let mut registry = self.inner.lock();
        if registry.shut_down {
            return Err(SchedulerError::ShutDown);
        }
        let replaced = match registry.jobs.remove(&name) {
            Some(old) => {
                self.inner.clock.cancel(old.timer);
                debug!(job = %name, "replacing job");
                true
            }
            None => false,
        };
        register(&self.inner, &mut registry, name, interval, erase(task));
        Ok(replaced)
    }

    /// Registers a job from a config entry.
    pub fn schedule_spec<F, E>(&self, spec: &JobSpec, task: F) -> Result<(), SchedulerError>
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        self.schedule(spec.name.clone(), spec.interval(), task)
    }

    /// Registers a job whose every firing submits `factory` to `queue`.
    ///
    /// The queue runs the produced tasks one at a time, so slow firings line
    /// up behind each other instead of overlapping. The firing itself only
    /// enqueues; task failures are reported (and logged) by the queue.
    pub fn schedule_queued<F, Fut, T, E>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        queue: &TaskQueue,
        factory: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let queue = queue.clone();
        let factory = Arc::new(factory);
        self.schedule(name, interval, move || {
            let factory = Arc::clone(&factory);
            let _ = queue.submit(move || (*factory)());
            Ok::<_, Infallible>(())
        })
    }

    /// Stops the job named `name`. Returns `false` if no such job is active.
    ///
    /// No firing starts after this returns. A firing already in progress on
    /// another thread is allowed to finish.
    pub fn cancel(&self, name: &str) -> bool {
        let mut registry = self.inner.lock();
        match registry.jobs.remove(name) {
            Some(job) => {
                self.inner.clock.cancel(job.timer);
                debug!(job = %name, fires = job.fires, "job cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every job and refuses further registrations.
    ///
    /// Called automatically when the scheduler is dropped.
    pub fn shutdown(&self) {
        let mut registry = self.inner.lock();
        if registry.shut_down {
            return;
        }
        registry.shut_down = true;
        let cancelled = registry.jobs.len();
        for (_, job) in registry.jobs.drain() {
            self.inner.clock.cancel(job.timer);
        }
        info!(cancelled, "scheduler shut down");
    }

    /// Returns `true` if a job with this name is active.
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.inner.lock().jobs.contains_key(name)
    }

    /// Number of active jobs.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Returns `true` if no job is active.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of every active job, sorted by name.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let registry = self.inner.lock();
        let mut jobs: Vec<JobInfo> = registry
            .jobs
            .iter()
            .map(|(name, job)| job.info(name))
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Snapshot of one job.
    pub fn job(&self, name: &str) -> Option<JobInfo> {
        self.inner.lock().jobs.get(name).map(|job| job.info(name))
    }
}

impl<C: Clock> Drop for CronScheduler<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<C: Clock> fmt::Debug for CronScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.lock();
        f.debug_struct("CronScheduler")
            .field("jobs", &registry.jobs.len())
            .field("shut_down", &registry.shut_down)
            .finish()
    }
}

fn check_interval(name: &str, interval: Duration) -> Result<(), SchedulerError> {
    if interval.is_zero() {
        return Err(SchedulerError::ZeroInterval {
            name: name.to_owned(),
        });
    }
    Ok(())
}

fn erase<F, E>(task: F) -> JobCallback
where
    F: Fn() -> Result<(), E> + Send + Sync + 'static,
    E: fmt::Display,
{
    Arc::new(move || task().map_err(|e| e.to_string()))
}

fn register<C: Clock>(
    inner: &Arc<Inner<C>>,
    registry: &mut Registry,
    name: String,
    interval: Duration,
    callback: JobCallback,
) {
    registry.next_generation += 1;
    let generation = registry.next_generation;
    // Saturates: an interval past the clock's range arms a timer that never fires.
    let next_fire = inner.clock.now().saturating_add(interval);
    let timer = arm(inner, &name, generation, next_fire);

    debug!(job = %name, interval = ?interval, "job scheduled");
    registry.jobs.insert(
        name,
        ScheduledJob {
            generation,
            interval,
            callback,
            timer,
            next_fire,
            fires: 0,
            failures: 0,
        },
    );
}

// Arms a one-shot timer for `deadline`. The timer holds only a weak reference
// so a dropped scheduler is never kept alive by its own timers.
fn arm<C: Clock>(inner: &Arc<Inner<C>>, name: &str, generation: u64, deadline: Duration) -> TimerId {
    let scheduler = Arc::downgrade(inner);
    let name = name.to_owned();
    let delay = deadline.saturating_sub(inner.clock.now());
    inner.clock.schedule_after(
        delay,
        Box::new(move || {
            if let Some(inner) = scheduler.upgrade() {
                fire(&inner, &name, generation);
            }
        }),
    )
}

fn fire<C: Clock>(inner: &Arc<Inner<C>>, name: &str, generation: u64) {
    let callback = {
        let mut registry = inner.lock();
        let Some(job) = registry.jobs.get_mut(name) else {
            return;
        };
        // A stale timer from a cancelled or replaced registration.
        if job.generation != generation {
            return;
        }
        let deadline = job.next_fire.saturating_add(job.interval);
        job.timer = arm(inner, name, generation, deadline);
        job.next_fire = deadline;
        job.fires += 1;
        Arc::clone(&job.callback)
    };

    let failed = match panic::catch_unwind(AssertUnwindSafe(|| (*callback)())) {
        Ok(Ok(())) => {
            debug!(job = %name, "job fired");
            false
        }
        Ok(Err(error)) => {
            warn!(job = %name, error = %error, "job callback failed");
            true
        }
        Err(_) => {
            warn!(job = %name, "job callback panicked");
            true
        }
    };

    if failed {
        let mut registry = inner.lock();
        if let Some(job) = registry.jobs.get_mut(name) {
            if job.generation == generation {
                job.failures += 1;
            }
        }
    }
}
