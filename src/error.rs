use std::fmt;

use thiserror::Error;

/// Returned by [`Queue::send`](crate::Queue::send) when the queue is closed for
/// writing. The rejected item is handed back to the caller.
#[derive(Error, PartialEq, Eq, Clone)]
#[error("sending on a closed queue")]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
  /// Recovers the item that could not be sent.
  pub fn into_inner(self) -> T {
    self.0
  }
}

impl<T> fmt::Debug for SendError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SendError").finish_non_exhaustive()
  }
}

/// Returned by [`Queue::try_send`](crate::Queue::try_send).
#[derive(Error, PartialEq, Eq, Clone)]
pub enum TrySendError<T> {
  /// The queue is at capacity (or, for a rendezvous queue, no receiver is waiting).
  #[error("queue is full")]
  Full(T),

  #[error("sending on a closed queue")]
  Closed(T),
}

impl<T> TrySendError<T> {
  pub fn into_inner(self) -> T {
    match self {
      TrySendError::Full(item) | TrySendError::Closed(item) => item,
    }
  }

  pub fn is_full(&self) -> bool {
    matches!(self, TrySendError::Full(_))
  }

  pub fn is_closed(&self) -> bool {
    matches!(self, TrySendError::Closed(_))
  }
}

impl<T> fmt::Debug for TrySendError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TrySendError::Full(_) => f.write_str("Full(..)"),
      TrySendError::Closed(_) => f.write_str("Closed(..)"),
    }
  }
}

impl<T> From<SendError<T>> for TrySendError<T> {
  fn from(err: SendError<T>) -> Self {
    TrySendError::Closed(err.0)
  }
}

/// The queue is closed for writing and every buffered item has been drained.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("queue is closed and exhausted")]
pub struct RecvError;

/// Returned by [`Queue::try_recv`](crate::Queue::try_recv).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
  #[error("queue is empty")]
  Empty,

  #[error("queue is closed and exhausted")]
  Exhausted,
}

impl From<RecvError> for TryRecvError {
  fn from(_: RecvError) -> Self {
    TryRecvError::Exhausted
  }
}

/// Errors raised by [`Guarded`](crate::Guarded) when a lock cannot be taken.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
  #[error("lock is already held by the current thread; re-entrant acquisition refused")]
  Reentrant,

  #[error("lock is held by another thread")]
  Contended,
}

/// Errors that can occur while configuring or driving a [`WorkerPool`](crate::WorkerPool).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("A worker pool needs at least one worker (got {0})")]
  InvalidWorkerCount(usize),

  #[error("Worker pool '{0}' has already been started and cannot be restarted")]
  AlreadyStarted(String),

  #[error("Worker pool '{0}' has not been started")]
  NotStarted(String),

  #[error("No Tokio runtime available to spawn workers: {0}")]
  NoRuntime(String),
}

/// Why a single job produced no value. Isolated to that job; the pool keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
  #[error("Job panicked on worker {worker}: {message}")]
  Panicked { worker: usize, message: String },
}
