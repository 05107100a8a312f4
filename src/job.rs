use crate::error::JobError;

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What a worker pushes onto the output queue for each job it finished.
pub type JobResult<R> = Result<R, JobError>;

/// The boxed future a worker drives for one job.
pub type JobFuture<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// Type-erased job-processing function shared by all workers of a pool.
pub(crate) type Processor<J, R> = Arc<dyn Fn(J) -> JobFuture<R> + Send + Sync + 'static>;

/// What a worker does with a job whose processing function panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicPolicy {
  /// Push `Err(JobError::Panicked { .. })` onto the output queue.
  #[default]
  Report,
  /// Log the panic and push nothing.
  Drop,
}

pub(crate) fn boxed_processor<J, R, F, Fut>(process: F) -> Processor<J, R>
where
  F: Fn(J) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = R> + Send + 'static,
{
  Arc::new(move |job| Box::pin(process(job)) as JobFuture<R>)
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
