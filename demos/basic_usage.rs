use futures_workpool::{JobResult, PoolConfig, Queue, WorkerPool};
use std::time::Duration;
use tracing::info;

async fn double(id: u64) -> u64 {
  let delay_ms = 100 + (id % 3) * 150;
  info!("Job {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  id * 2
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Usage Example ---");

  let jobs: Queue<u64> = Queue::named("jobs", 5);
  let results: Queue<JobResult<u64>> = Queue::named("results", 5);
  let pool = WorkerPool::new(
    PoolConfig::new(3).name("basic_pool"),
    jobs.clone(),
    results.clone(),
    None,
    double,
  )?;
  pool.start()?;

  for id in 1..=5 {
    jobs.send(id).await?;
    info!("Enqueued job {}", id);
  }
  jobs.close();
  info!("All jobs enqueued and input closed. Draining results...");

  while let Ok(outcome) = results.recv().await {
    match outcome {
      Ok(value) => info!("Result: {}", value),
      Err(e) => info!("Job failed: {}", e),
    }
    if results.total_received() == 5 {
      break;
    }
  }

  let stats = pool.wait().await?;
  info!(?stats, "Pool terminated.");
  info!("--- Basic Usage Example End ---");
  Ok(())
}
