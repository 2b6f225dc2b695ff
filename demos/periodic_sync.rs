//! Wires a scheduler to a queue using job intervals from JSON config.
//!
//! Run with `RUST_LOG=debug cargo run --example periodic_sync` to see the
//! queue and scheduler log records.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rtask::{CronScheduler, SchedulerConfig, TaskQueue, TokioClock};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "jobs": [
        { "name": "sync-orders", "interval_ms": 400 },
        { "name": "heartbeat", "interval_ms": 250 }
    ]
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = SchedulerConfig::from_json_str(CONFIG)?;
    let queue = TaskQueue::named("orders");
    let scheduler = CronScheduler::new(TokioClock::new());

    let batch = Arc::new(AtomicU32::new(0));
    let sync = config.job("sync-orders").ok_or("sync-orders missing from config")?;
    scheduler.schedule_queued(&sync.name, sync.interval(), &queue, move || {
        let batch = batch.fetch_add(1, Ordering::SeqCst);
        async move {
            // Slower than the interval on purpose; the queue keeps runs apart.
            tokio::time::sleep(Duration::from_millis(600)).await;
            if batch % 3 == 2 {
                return Err(format!("batch {batch} rejected by upstream"));
            }
            println!("synced batch {batch}");
            Ok(())
        }
    })?;

    let heartbeat = config.job("heartbeat").ok_or("heartbeat missing from config")?;
    scheduler.schedule_spec(heartbeat, || {
        println!("heartbeat");
        Ok::<_, std::convert::Infallible>(())
    })?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    scheduler.shutdown();
    queue.wait_idle().await;

    println!("{}", serde_json::to_string_pretty(&queue.stats())?);
    Ok(())
}
