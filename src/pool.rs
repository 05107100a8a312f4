use crate::cancel::{CancelCause, CancelToken};
use crate::error::{JobError, PoolError, RecvError};
use crate::guarded::Counter;
use crate::job::{boxed_processor, panic_message, JobResult, PanicPolicy, Processor};
use crate::queue::Queue;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Lifecycle of a [`WorkerPool`]. A pool only ever moves forward through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
  /// Built, no worker running yet.
  Constructed,
  /// Workers are draining the input queue.
  Running,
  /// Input closed or cancellation requested; workers are finishing up.
  Draining,
  /// Every worker has exited. Buffered results may still sit in the output queue.
  Terminated,
}

/// Settings for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
  /// Used in log fields and error messages.
  pub name: String,
  /// Number of concurrent workers, at least one.
  pub workers: usize,
  pub panic_policy: PanicPolicy,
  /// Runtime the workers are spawned on. Defaults to the runtime current at `start`.
  pub runtime: Option<TokioHandle>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    let id = NEXT_POOL_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    Self {
      name: format!("pool-{}", id),
      workers: 1,
      panic_policy: PanicPolicy::default(),
      runtime: None,
    }
  }
}

impl PoolConfig {
  pub fn new(workers: usize) -> Self {
    Self {
      workers,
      ..Self::default()
    }
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn panic_policy(mut self, policy: PanicPolicy) -> Self {
    self.panic_policy = policy;
    self
  }

  pub fn runtime(mut self, handle: TokioHandle) -> Self {
    self.runtime = Some(handle);
    self
  }
}

/// Point-in-time job accounting for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
  pub workers: usize,
  /// Items ever accepted by the input queue.
  pub jobs_enqueued: u64,
  /// Jobs workers took off the input queue.
  pub jobs_taken: u64,
  /// Jobs whose value was delivered to the output queue.
  pub jobs_completed: u64,
  /// Jobs whose processing panicked and whose failure was reported or, under
  /// [`PanicPolicy::Drop`], deliberately skipped.
  pub jobs_failed: u64,
  /// Jobs taken after cancellation was observed and never processed.
  pub jobs_discarded: u64,
  /// Processed jobs whose result or failure report never reached the output
  /// queue, because it was closed or cancellation arrived while it was full.
  pub results_dropped: u64,
  /// Jobs still buffered in the input queue.
  pub jobs_pending: u64,
}

impl PoolStats {
  /// Jobs enqueued that did not reach a completed or failed outcome.
  pub fn unprocessed(&self) -> u64 {
    self
      .jobs_enqueued
      .saturating_sub(self.jobs_completed + self.jobs_failed)
  }
}

#[derive(Debug, Default)]
struct JobCounters {
  taken: Counter,
  completed: Counter,
  failed: Counter,
  discarded: Counter,
  dropped: Counter,
}

enum Delivery {
  Sent,
  OutputClosed,
  Cancelled(CancelCause),
}

#[derive(Debug)]
enum WorkerExit {
  InputExhausted,
  Cancelled(CancelCause),
  OutputClosed,
}

struct PoolInner<J: Send + 'static, R: Send + 'static> {
  pool_name: Arc<String>,
  worker_count: usize,
  panic_policy: PanicPolicy,
  runtime: Option<TokioHandle>,
  input: Queue<J>,
  output: Queue<JobResult<R>>,
  halt: CancelToken,
  process: Processor<J, R>,
  counters: JobCounters,
  state: Mutex<PoolState>,
  live_workers: AtomicUsize,
  finished: CancellationToken,
  in_flight: DashMap<usize, Instant>,
  worker_join_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A fixed number of workers draining an input queue of jobs into an output
/// queue of [`JobResult`]s.
///
/// The pool owns its workers: every spawned worker is joined by
/// [`wait`](Self::wait), and dropping an unfinished pool cancels intake so no
/// worker outlives its owner unobserved.
pub struct WorkerPool<J: Send + 'static, R: Send + 'static> {
  inner: Arc<PoolInner<J, R>>,
}

impl<J: Send + 'static, R: Send + 'static> WorkerPool<J, R> {
  /// Builds a pool. No worker runs until [`start`](Self::start).
  ///
  /// `cancel`, when given, is observed by every worker between jobs. The pool
  /// derives its own child token from it, so [`cancel`](Self::cancel) on the
  /// pool never cancels the caller's token.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidWorkerCount` if `config.workers` is zero.
  pub fn new<F, Fut>(
    config: PoolConfig,
    input: Queue<J>,
    output: Queue<JobResult<R>>,
    cancel: Option<&CancelToken>,
    process: F,
  ) -> Result<Self, PoolError>
  where
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    if config.workers == 0 {
      return Err(PoolError::InvalidWorkerCount(config.workers));
    }
    let halt = match cancel {
      Some(token) => token.child_token(),
      None => CancelToken::new(),
    };

    debug!(pool_name = %config.name, workers = config.workers, "Worker pool constructed.");
    Ok(Self {
      inner: Arc::new(PoolInner {
        pool_name: Arc::new(config.name),
        worker_count: config.workers,
        panic_policy: config.panic_policy,
        runtime: config.runtime,
        input,
        output,
        halt,
        process: boxed_processor(process),
        counters: JobCounters::default(),
        state: Mutex::new(PoolState::Constructed),
        live_workers: AtomicUsize::new(0),
        finished: CancellationToken::new(),
        in_flight: DashMap::new(),
        worker_join_handles: Mutex::new(Vec::new()),
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.pool_name
  }

  pub fn workers(&self) -> usize {
    self.inner.worker_count
  }

  pub fn input(&self) -> &Queue<J> {
    &self.inner.input
  }

  pub fn output(&self) -> &Queue<JobResult<R>> {
    &self.inner.output
  }

  pub fn state(&self) -> PoolState {
    let state = *self.inner.state.lock();
    if state == PoolState::Running && (self.inner.input.is_closed() || self.inner.halt.is_cancelled()) {
      PoolState::Draining
    } else {
      state
    }
  }

  /// Number of jobs currently inside the processing function.
  pub fn in_flight(&self) -> usize {
    self.inner.in_flight.len()
  }

  pub fn stats(&self) -> PoolStats {
    let counters = &self.inner.counters;
    PoolStats {
      workers: self.inner.worker_count,
      jobs_enqueued: self.inner.input.total_sent(),
      jobs_taken: counters.taken.get(),
      jobs_completed: counters.completed.get(),
      jobs_failed: counters.failed.get(),
      jobs_discarded: counters.discarded.get(),
      results_dropped: counters.dropped.get(),
      jobs_pending: self.inner.input.len() as u64,
    }
  }

  /// Spawns the workers.
  ///
  /// # Errors
  /// `PoolError::AlreadyStarted` on any call after the first,
  /// `PoolError::NoRuntime` if no runtime was configured and none is current.
  pub fn start(&self) -> Result<(), PoolError> {
    let runtime = {
      let mut state = self.inner.state.lock();
      if *state != PoolState::Constructed {
        warn!(pool_name = %self.inner.pool_name, "Start: pool was already started.");
        return Err(PoolError::AlreadyStarted(self.inner.pool_name.to_string()));
      }
      let runtime = match &self.inner.runtime {
        Some(handle) => handle.clone(),
        None => TokioHandle::try_current().map_err(|e| PoolError::NoRuntime(e.to_string()))?,
      };
      self.inner.live_workers.store(self.inner.worker_count, AtomicOrdering::Release);
      *state = PoolState::Running;
      runtime
    };

    info!(pool_name = %self.inner.pool_name, workers = self.inner.worker_count, "Starting worker pool.");
    let handles: Vec<JoinHandle<()>> = (0..self.inner.worker_count)
      .map(|worker_id| {
        let inner = self.inner.clone();
        runtime.spawn(
          Self::run_worker(inner, worker_id)
            .instrument(info_span!("pool_worker", pool = %*self.inner.pool_name, worker = worker_id)),
        )
      })
      .collect();
    self.inner.worker_join_handles.lock().extend(handles);
    Ok(())
  }

  /// Stops job intake. Workers finish the job they are processing, then exit.
  /// A worker still waiting for room in a full output queue drops its result.
  pub fn cancel(&self) {
    info!(pool_name = %self.inner.pool_name, "Cancellation requested for worker pool.");
    self.inner.halt.cancel();
  }

  /// Waits until every worker has exited and returns the final accounting.
  ///
  /// Can be awaited from several tasks at once. When it returns, the output
  /// queue has received exactly `jobs_completed` values plus the reported
  /// failures.
  ///
  /// # Errors
  /// `PoolError::NotStarted` if [`start`](Self::start) was never called.
  pub async fn wait(&self) -> Result<PoolStats, PoolError> {
    let state = *self.inner.state.lock();
    if state == PoolState::Constructed {
      return Err(PoolError::NotStarted(self.inner.pool_name.to_string()));
    }

    // Extract the handles from the mutex, then drop the guard before awaiting.
    let handles_to_await: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.worker_join_handles.lock());
    if !handles_to_await.is_empty() {
      info!(pool_name = %self.inner.pool_name, "Waiting for {} workers to join.", handles_to_await.len());
    }
    for handle in handles_to_await {
      if let Err(join_error) = handle.await {
        error!(pool_name = %self.inner.pool_name, "Error joining worker: {:?}", join_error);
      }
    }
    // Handles may have been taken by a concurrent waiter.
    self.inner.finished.cancelled().await;

    let stats = self.stats();
    debug!(pool_name = %self.inner.pool_name, ?stats, "Worker pool joined.");
    Ok(stats)
  }

  async fn run_worker(inner: Arc<PoolInner<J, R>>, worker_id: usize) {
    let _exit_guard = WorkerExitGuard {
      inner: &inner,
      worker_id,
    };
    trace!("Worker started.");

    let exit = loop {
      if let Some(cause) = inner.halt.cause() {
        break WorkerExit::Cancelled(cause);
      }

      let received = tokio::select! {
        biased;
        cause = inner.halt.wait_cancelled() => break WorkerExit::Cancelled(cause),
        received = inner.input.recv() => received,
      };
      let job = match received {
        Ok(job) => job,
        Err(RecvError) => break WorkerExit::InputExhausted,
      };
      inner.counters.taken.increment();

      if let Some(cause) = inner.halt.cause() {
        inner.counters.discarded.increment();
        debug!(?cause, "Cancellation observed after dequeue; discarding job.");
        break WorkerExit::Cancelled(cause);
      }

      let (result, panicked) = match inner.execute(worker_id, job).await {
        Ok(value) => (Ok(value), false),
        Err(job_error) => match inner.panic_policy {
          PanicPolicy::Report => (Err(job_error), true),
          PanicPolicy::Drop => {
            inner.counters.failed.increment();
            debug!("Panicked job dropped per panic policy.");
            continue;
          }
        },
      };
      match inner.deliver(result).await {
        Delivery::Sent if panicked => {
          inner.counters.failed.increment();
        }
        Delivery::Sent => {
          inner.counters.completed.increment();
        }
        Delivery::OutputClosed => {
          inner.counters.dropped.increment();
          warn!("Output queue closed; result dropped and worker stopping.");
          break WorkerExit::OutputClosed;
        }
        Delivery::Cancelled(cause) => {
          inner.counters.dropped.increment();
          debug!(?cause, "Cancelled while the output queue was full; result dropped.");
          break WorkerExit::Cancelled(cause);
        }
      }
    };

    debug!(?exit, "Worker exiting.");
  }
}

impl<J: Send + 'static, R: Send + 'static> PoolInner<J, R> {
  /// Hands a result to the output queue, giving up once cancellation is requested.
  async fn deliver(&self, result: JobResult<R>) -> Delivery {
    tokio::select! {
      biased;
      sent = self.output.send(result) => match sent {
        Ok(()) => Delivery::Sent,
        Err(_) => Delivery::OutputClosed,
      },
      cause = self.halt.wait_cancelled() => Delivery::Cancelled(cause),
    }
  }

  async fn execute(&self, worker_id: usize, job: J) -> JobResult<R> {
    self.in_flight.insert(worker_id, Instant::now());
    let process = self.process.clone();
    let outcome = AssertUnwindSafe(async move { process(job).await })
      .catch_unwind()
      .await;
    if let Some((_, started)) = self.in_flight.remove(&worker_id) {
      trace!(elapsed = ?started.elapsed(), "Job processed.");
    }

    outcome.map_err(|payload| {
      let message = panic_message(payload.as_ref());
      error!(%message, "Job panicked during processing.");
      JobError::Panicked {
        worker: worker_id,
        message,
      }
    })
  }
}

/// Runs when a worker future ends, however it ends.
struct WorkerExitGuard<'a, J: Send + 'static, R: Send + 'static> {
  inner: &'a PoolInner<J, R>,
  worker_id: usize,
}

impl<J: Send + 'static, R: Send + 'static> Drop for WorkerExitGuard<'_, J, R> {
  fn drop(&mut self) {
    self.inner.in_flight.remove(&self.worker_id);
    let remaining = self.inner.live_workers.fetch_sub(1, AtomicOrdering::AcqRel) - 1;
    {
      let mut state = self.inner.state.lock();
      if remaining == 0 {
        *state = PoolState::Terminated;
      } else if *state == PoolState::Running {
        *state = PoolState::Draining;
      }
    }
    if remaining == 0 {
      info!(pool_name = %self.inner.pool_name, "All workers exited; pool terminated.");
      self.inner.finished.cancel();
    }
  }
}

impl<J: Send + 'static, R: Send + 'static> Drop for WorkerPool<J, R> {
  fn drop(&mut self) {
    let state = *self.inner.state.lock();
    if matches!(state, PoolState::Running | PoolState::Draining) && !self.inner.halt.is_cancelled() {
      info!(
        pool_name = %self.inner.pool_name,
        "WorkerPool dropped before its workers finished. Cancelling intake so they exit."
      );
      self.inner.halt.cancel();
    } else {
      trace!(pool_name = %self.inner.pool_name, ?state, "WorkerPool dropped.");
    }
  }
}
