//! A Tokio-based bounded worker pool, with the primitives it is built from:
//! rendezvous-capable bounded queues, hierarchical deadline-aware
//! cancellation, a fair multiplexed wait over queues, and lock-guarded
//! shared state.
//!
//! ```no_run
//! use futures_workpool::{JobResult, PoolConfig, Queue, WorkerPool};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let jobs: Queue<u64> = Queue::new(5);
//! let results: Queue<JobResult<u64>> = Queue::new(5);
//!
//! let pool = WorkerPool::new(PoolConfig::new(3), jobs.clone(), results.clone(), None, |n| async move { n * 2 })?;
//! pool.start()?;
//! for n in 1..=5 {
//!   jobs.send(n).await?;
//! }
//! jobs.close();
//! let stats = pool.wait().await?;
//! assert_eq!(stats.jobs_completed, 5);
//! # Ok(())
//! # }
//! ```

mod cancel;
mod error;
mod guarded;
mod job;
mod pool;
mod queue;
mod select;

pub use cancel::{CancelCause, CancelToken};
pub use error::{JobError, LockError, PoolError, RecvError, SendError, TryRecvError, TrySendError};
pub use guarded::{Counter, Guarded};
pub use job::{JobFuture, JobResult, PanicPolicy};
pub use pool::{PoolConfig, PoolState, PoolStats, WorkerPool};
pub use queue::Queue;
pub use select::{Select, Selected};
