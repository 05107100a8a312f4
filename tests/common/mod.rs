use futures_workpool::{JobResult, Queue};

// Helper to initialize tracing for tests (call from each test; Once keeps it to one init)
pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_workpool=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// Closes `output` and collects everything still buffered in it.
#[allow(dead_code)]
pub fn drain_results<R>(output: &Queue<JobResult<R>>) -> Vec<JobResult<R>> {
  output.close();
  std::iter::from_fn(|| output.try_recv().ok()).collect()
}
