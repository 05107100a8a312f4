use futures_workpool::{CancelToken, JobResult, PoolConfig, Queue, WorkerPool};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Deadline Cancellation Example ---");

  let deadline = CancelToken::with_timeout(Duration::from_millis(350));
  let jobs: Queue<u32> = Queue::new(20);
  let results: Queue<JobResult<u32>> = Queue::new(20);
  let pool = WorkerPool::new(
    PoolConfig::new(2).name("deadline_pool"),
    jobs.clone(),
    results.clone(),
    Some(&deadline),
    |n: u32| async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      n
    },
  )?;
  pool.start()?;

  for n in 0..20 {
    jobs.send(n).await?;
  }
  // The input stays open: only the deadline stops the workers.
  let cause = deadline.wait_cancelled().await;
  info!(?cause, "Deadline token fired.");

  let stats = pool.wait().await?;
  info!(
    "Processed {} of {} jobs before the deadline; {} still queued.",
    stats.jobs_completed, stats.jobs_enqueued, stats.jobs_pending
  );
  info!("--- Deadline Cancellation Example End ---");
  Ok(())
}
