//! # rtask
//!
//! In-process background work for Tokio applications: an ordered,
//! single-flight task queue and a named interval-job scheduler.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rtask::{CronScheduler, TaskQueue, TokioClock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = TaskQueue::named("sync");
//!     let scheduler = CronScheduler::new(TokioClock::new());
//!
//!     // Every minute, enqueue a sync; runs never overlap even if one is slow.
//!     scheduler.schedule_queued("sync-orders", Duration::from_secs(60), &queue, || async {
//!         // ... call the remote API ...
//!         Ok::<_, std::io::Error>(())
//!     })?;
//!
//!     let total = queue.run(|| async { Ok::<_, std::io::Error>(40 + 2) }).await?;
//!     println!("one-off task returned {total}");
//!
//!     tokio::time::sleep(Duration::from_secs(300)).await;
//!     scheduler.shutdown();
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod queue;
pub mod scheduler;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{ConfigError, JobSpec, SchedulerConfig};
pub use queue::{QueueError, QueueStats, TaskError, TaskHandle, TaskQueue};
pub use scheduler::{CronScheduler, JobInfo, SchedulerError};
