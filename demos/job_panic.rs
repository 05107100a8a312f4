use futures_workpool::{JobError, JobResult, PoolConfig, Queue, WorkerPool};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Job Panic Example ---");

  let jobs: Queue<u32> = Queue::new(4);
  let results: Queue<JobResult<u32>> = Queue::new(4);
  let pool = WorkerPool::new(
    PoolConfig::new(2).name("panic_pool"),
    jobs.clone(),
    results.clone(),
    None,
    |n: u32| async move {
      if n == 2 {
        panic!("job {} cannot be processed", n);
      }
      n * 10
    },
  )?;
  pool.start()?;

  for n in 1..=4 {
    jobs.send(n).await?;
  }
  jobs.close();

  let stats = pool.wait().await?;
  results.close();
  while let Ok(outcome) = results.recv().await {
    match outcome {
      Ok(value) => info!("Job succeeded with {}", value),
      Err(JobError::Panicked { worker, message }) => error!("Worker {} caught a panic: {}", worker, message),
    }
  }
  info!(
    "Completed {} jobs, {} failed; the pool survived the panic.",
    stats.jobs_completed, stats.jobs_failed
  );
  info!("--- Job Panic Example End ---");
  Ok(())
}
