//! Waiting on several queues at once.
//!
//! A [`Select`] collects receive arms, send arms and an optional deadline,
//! then resolves exactly one of them. When several arms are ready at the same
//! time the winner is picked uniformly at random, so no arm can be starved by
//! the order it was declared in.
//!
//! ```no_run
//! # async fn demo() {
//! use futures_workpool::{Queue, Select, Selected};
//! use std::time::Duration;
//!
//! let orders: Queue<u32> = Queue::new(8);
//! let refunds: Queue<u32> = Queue::new(8);
//!
//! match Select::new()
//!   .recv(&orders, |r| r.map(|id| format!("order {id}")))
//!   .recv(&refunds, |r| r.map(|id| format!("refund {id}")))
//!   .timeout(Duration::from_secs(1))
//!   .wait()
//!   .await
//! {
//!   Selected::Ready(Ok(event)) => println!("{event}"),
//!   Selected::Ready(Err(_)) => println!("a queue is exhausted"),
//!   Selected::TimedOut => println!("nothing within a second"),
//!   Selected::Default => unreachable!("wait() never takes the default branch"),
//! }
//! # }
//! ```

use crate::error::{RecvError, SendError, TryRecvError, TrySendError};
use crate::queue::Queue;

use std::pin::Pin;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::trace;

/// How a [`Select`] resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selected<O> {
  /// One arm fired; carries what its callback returned.
  Ready(O),
  /// The deadline elapsed before any arm was ready.
  TimedOut,
  /// [`Select::try_select`] found no arm ready.
  Default,
}

impl<O> Selected<O> {
  pub fn ready(self) -> Option<O> {
    match self {
      Selected::Ready(value) => Some(value),
      _ => None,
    }
  }

  pub fn is_timed_out(&self) -> bool {
    matches!(self, Selected::TimedOut)
  }
}

/// One pending operation of a select.
trait Arm<'a, O>: Send {
  /// Performs the operation if it can complete without waiting.
  /// Has no effect when it returns `None`.
  fn try_fire(&mut self) -> Option<O>;

  /// A wake-up registered with whatever makes this arm ready.
  fn listen(&self) -> Pin<Box<Notified<'a>>>;

  /// Keeps the arm visible to rendezvous senders while the select is blocked.
  fn register_interest(&self) -> Option<Box<dyn Send + 'a>>;
}

struct RecvArm<'a, T, F> {
  queue: &'a Queue<T>,
  on_ready: Option<F>,
}

impl<'a, T, O, F> Arm<'a, O> for RecvArm<'a, T, F>
where
  T: Send + 'a,
  F: FnOnce(Result<T, RecvError>) -> O + Send + 'a,
{
  fn try_fire(&mut self) -> Option<O> {
    self.on_ready.as_ref()?;
    let outcome = match self.queue.try_recv() {
      Ok(item) => Ok(item),
      Err(TryRecvError::Exhausted) => Err(RecvError),
      Err(TryRecvError::Empty) => return None,
    };
    self.on_ready.take().map(|on_ready| on_ready(outcome))
  }

  fn listen(&self) -> Pin<Box<Notified<'a>>> {
    Box::pin(self.queue.readable())
  }

  fn register_interest(&self) -> Option<Box<dyn Send + 'a>> {
    Some(Box::new(self.queue.register_receiver()))
  }
}

struct SendArm<'a, T, F> {
  queue: &'a Queue<T>,
  item: Option<T>,
  on_ready: Option<F>,
}

impl<'a, T, O, F> Arm<'a, O> for SendArm<'a, T, F>
where
  T: Send + 'a,
  F: FnOnce(Result<(), SendError<T>>) -> O + Send + 'a,
{
  fn try_fire(&mut self) -> Option<O> {
    self.on_ready.as_ref()?;
    let item = self.item.take()?;
    let outcome = match self.queue.try_send(item) {
      Ok(()) => Ok(()),
      Err(TrySendError::Closed(item)) => Err(SendError(item)),
      Err(TrySendError::Full(item)) => {
        self.item = Some(item);
        return None;
      }
    };
    self.on_ready.take().map(|on_ready| on_ready(outcome))
  }

  fn listen(&self) -> Pin<Box<Notified<'a>>> {
    Box::pin(self.queue.writable())
  }

  fn register_interest(&self) -> Option<Box<dyn Send + 'a>> {
    None
  }
}

/// A one-shot wait over several queue operations.
///
/// Built with [`recv`](Self::recv), [`send`](Self::send) and optionally
/// [`timeout`](Self::timeout)/[`deadline`](Self::deadline), then resolved
/// with [`wait`](Self::wait) or, for a non-blocking attempt,
/// [`try_select`](Self::try_select). Each arm carries a callback mapping its
/// outcome into the common output type `O`; only the winning arm's callback
/// runs, and only the winning arm's operation takes effect.
pub struct Select<'a, O> {
  arms: Vec<Box<dyn Arm<'a, O> + 'a>>,
  deadline: Option<Instant>,
}

impl<'a, O: 'a> Select<'a, O> {
  pub fn new() -> Self {
    Self {
      arms: Vec::new(),
      deadline: None,
    }
  }

  /// Adds an arm that receives from `queue`.
  ///
  /// The arm is ready when an item is available or the queue is exhausted;
  /// `on_ready` gets `Err(RecvError)` in the latter case.
  pub fn recv<T, F>(mut self, queue: &'a Queue<T>, on_ready: F) -> Self
  where
    T: Send + 'a,
    F: FnOnce(Result<T, RecvError>) -> O + Send + 'a,
  {
    self.arms.push(Box::new(RecvArm {
      queue,
      on_ready: Some(on_ready),
    }));
    self
  }

  /// Adds an arm that sends `item` into `queue`.
  ///
  /// The arm is ready when the queue has room (or, for a rendezvous queue, a
  /// receiver is waiting), or when it is closed; `on_ready` then gets the item
  /// back inside `SendError`. If another arm wins, the item is dropped with
  /// the select.
  pub fn send<T, F>(mut self, queue: &'a Queue<T>, item: T, on_ready: F) -> Self
  where
    T: Send + 'a,
    F: FnOnce(Result<(), SendError<T>>) -> O + Send + 'a,
  {
    self.arms.push(Box::new(SendArm {
      queue,
      item: Some(item),
      on_ready: Some(on_ready),
    }));
    self
  }

  /// Gives up with [`Selected::TimedOut`] once `timeout` has elapsed, counted from now.
  pub fn timeout(self, timeout: Duration) -> Self {
    self.deadline(Instant::now() + timeout)
  }

  /// Gives up with [`Selected::TimedOut`] at `deadline`. The earliest of several deadlines wins.
  pub fn deadline(mut self, deadline: Instant) -> Self {
    self.deadline = Some(match self.deadline {
      Some(existing) => existing.min(deadline),
      None => deadline,
    });
    self
  }

  /// Resolves one ready arm without waiting, or returns [`Selected::Default`].
  pub fn try_select(mut self) -> Selected<O> {
    match self.fire_random() {
      Some(value) => Selected::Ready(value),
      None => Selected::Default,
    }
  }

  /// Waits until one arm is ready and resolves it, or until the deadline.
  ///
  /// A select with no arms and no deadline never resolves.
  pub async fn wait(mut self) -> Selected<O> {
    let mut interest: Vec<Box<dyn Send + 'a>> = Vec::new();
    let mut registered = false;
    loop {
      let mut listeners: Vec<Pin<Box<Notified<'a>>>> = self.arms.iter().map(|arm| arm.listen()).collect();
      for listener in listeners.iter_mut() {
        listener.as_mut().enable();
      }

      if let Some(value) = self.fire_random() {
        return Selected::Ready(value);
      }
      if !registered {
        // Re-check once after announcing interest, in case a rendezvous
        // sender was waiting for a receiver to show up.
        interest.extend(self.arms.iter().filter_map(|arm| arm.register_interest()));
        registered = true;
        continue;
      }

      let any_arm = async move {
        if listeners.is_empty() {
          futures::future::pending::<()>().await;
        } else {
          futures::future::select_all(listeners).await;
        }
      };
      match self.deadline {
        Some(deadline) => {
          tokio::select! {
            _ = any_arm => {}
            _ = tokio::time::sleep_until(deadline) => {
              trace!(arms = self.arms.len(), "Select timed out.");
              return Selected::TimedOut;
            }
          }
        }
        None => any_arm.await,
      }
    }
  }

  /// Tries every arm once, in a fresh uniformly random order.
  fn fire_random(&mut self) -> Option<O> {
    let mut order: Vec<usize> = (0..self.arms.len()).collect();
    order.shuffle(&mut rand::rng());
    let arms = &mut self.arms;
    order.into_iter().find_map(|index| arms[index].try_fire())
  }
}

impl<'a, O: 'a> Default for Select<'a, O> {
  fn default() -> Self {
    Self::new()
  }
}
