use crate::error::{RecvError, SendError, TryRecvError, TrySendError};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// A bounded, multi-producer, multi-consumer FIFO queue.
///
/// `Queue` is a cheap handle: clones share the same underlying buffer, so the
/// same value can be handed to producers, consumers and a [`WorkerPool`](crate::WorkerPool).
///
/// With a capacity of `C > 0`, up to `C` items are buffered before `send`
/// waits for room. A capacity of `0` makes the queue a rendezvous point: every
/// `send` waits until a receiver has taken the item.
///
/// Closing is explicit and one-way. After [`close`](Self::close) no new item is
/// accepted, blocked senders get their item back, and receivers keep draining
/// whatever was already buffered until [`recv`](Self::recv) reports
/// [`RecvError`].
pub struct Queue<T> {
  shared: Arc<Shared<T>>,
}

struct Shared<T> {
  name: Arc<str>,
  capacity: usize,
  state: Mutex<State<T>>,
  /// Signalled when an item arrives or the queue closes.
  readable: Notify,
  /// Signalled when room frees up, a parked item is taken, a receiver starts
  /// waiting, or the queue closes.
  writable: Notify,
}

/// An item that did not fit into the buffer.
///
/// A `ticket` identifies the blocked `send` that owns it. Items handed off by
/// `try_send` to a waiting receiver carry no ticket.
struct Parked<T> {
  ticket: Option<u64>,
  item: T,
}

struct State<T> {
  buffer: VecDeque<T>,
  parked: VecDeque<Parked<T>>,
  // Parked items rejected by `close`, waiting for their sender to reclaim them.
  bounced: Vec<(u64, T)>,
  next_ticket: u64,
  waiting_receivers: usize,
  closed: bool,
  sent: u64,
  received: u64,
}

impl<T> State<T> {
  /// Pops the next item in FIFO order and refills the buffer from parked sends.
  fn take(&mut self, capacity: usize) -> Option<T> {
    let item = match self.buffer.pop_front() {
      Some(item) => item,
      None => {
        let parked = self.parked.pop_front()?;
        self.sent += 1;
        parked.item
      }
    };
    while self.buffer.len() < capacity {
      match self.parked.pop_front() {
        Some(parked) => {
          self.buffer.push_back(parked.item);
          self.sent += 1;
        }
        None => break,
      }
    }
    self.received += 1;
    Some(item)
  }

  fn is_parked(&self, ticket: u64) -> bool {
    self.parked.iter().any(|p| p.ticket == Some(ticket))
  }

  fn withdraw(&mut self, ticket: u64) -> Option<T> {
    let pos = self.parked.iter().position(|p| p.ticket == Some(ticket))?;
    self.parked.remove(pos).map(|p| p.item)
  }

  fn reclaim_bounced(&mut self, ticket: u64) -> Option<T> {
    let pos = self.bounced.iter().position(|(t, _)| *t == ticket)?;
    Some(self.bounced.swap_remove(pos).1)
  }

  /// Items `try_send` handed off to a waiting receiver that no receiver has taken yet.
  fn handoffs(&self) -> usize {
    self.parked.iter().filter(|p| p.ticket.is_none()).count()
  }

  /// Receivers currently waiting that no parked item is already destined for.
  fn unclaimed_receivers(&self) -> usize {
    self.waiting_receivers.saturating_sub(self.parked.len())
  }
}

impl<T> Queue<T> {
  /// Creates a queue holding at most `capacity` buffered items.
  pub fn new(capacity: usize) -> Self {
    Self::named("queue", capacity)
  }

  /// Creates a queue whose `name` shows up in trace output.
  pub fn named(name: impl Into<String>, capacity: usize) -> Self {
    let name: String = name.into();
    Self {
      shared: Arc::new(Shared {
        name: Arc::from(name),
        capacity,
        state: Mutex::new(State {
          buffer: VecDeque::with_capacity(capacity.min(1024)),
          parked: VecDeque::new(),
          bounced: Vec::new(),
          next_ticket: 0,
          waiting_receivers: 0,
          closed: false,
          sent: 0,
          received: 0,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  pub fn capacity(&self) -> usize {
    self.shared.capacity
  }

  /// Number of items accepted by the queue and not yet received.
  ///
  /// Blocked `send` calls are not counted, so this stays within
  /// [`capacity`](Self::capacity) except on a rendezvous queue whose waiting
  /// receiver went away after `try_send` handed it an item. That item is
  /// counted here until the next receiver takes it.
  ///
  /// Only meant for observation; by the time the caller looks at it another
  /// task may already have changed it.
  pub fn len(&self) -> usize {
    let state = self.shared.state.lock();
    state.buffer.len() + state.handoffs()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().closed
  }

  /// Total number of items accepted into the queue so far.
  pub fn total_sent(&self) -> u64 {
    self.shared.state.lock().sent
  }

  /// Total number of items handed to receivers so far.
  pub fn total_received(&self) -> u64 {
    self.shared.state.lock().received
  }

  /// Sends an item, waiting while the queue is full.
  ///
  /// On a rendezvous queue this returns only once a receiver has taken the
  /// item. If the future is dropped before completing, the item is withdrawn
  /// and will not be delivered.
  ///
  /// # Errors
  /// Returns the item inside `SendError` if the queue is closed, either
  /// before the call or while the send is waiting.
  pub async fn send(&self, item: T) -> Result<(), SendError<T>> {
    let ticket = {
      let mut state = self.shared.state.lock();
      if state.closed {
        return Err(SendError(item));
      }
      if state.parked.is_empty() && state.buffer.len() < self.shared.capacity {
        state.buffer.push_back(item);
        state.sent += 1;
        drop(state);
        self.shared.readable.notify_waiters();
        return Ok(());
      }
      let ticket = state.next_ticket;
      state.next_ticket += 1;
      state.parked.push_back(Parked {
        ticket: Some(ticket),
        item,
      });
      ticket
    };
    trace!(queue = %self.shared.name, ticket, "Send is waiting for a receiver to make room.");
    self.shared.readable.notify_waiters();

    let mut pending = PendingSend {
      shared: &self.shared,
      ticket,
      settled: false,
    };
    loop {
      let notified = self.shared.writable.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if let Some(outcome) = pending.settle() {
        return outcome;
      }
      notified.await;
    }
  }

  /// Sends an item only if that can happen without waiting.
  ///
  /// On a rendezvous queue this succeeds only when a receiver is currently
  /// waiting; the item is handed to the next receiver to take from the queue.
  /// Should that receiver be cancelled first, the item stays queued, shows up
  /// in [`len`](Self::len), and goes to whichever receiver comes next.
  ///
  /// # Errors
  /// `TrySendError::Full` when there is no room, `TrySendError::Closed` when
  /// the queue is closed. Both return the item.
  pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
    {
      let mut state = self.shared.state.lock();
      if state.closed {
        return Err(TrySendError::Closed(item));
      }
      if state.parked.is_empty() && state.buffer.len() < self.shared.capacity {
        state.buffer.push_back(item);
        state.sent += 1;
      } else if self.shared.capacity == 0 && state.unclaimed_receivers() > 0 {
        state.parked.push_back(Parked { ticket: None, item });
      } else {
        return Err(TrySendError::Full(item));
      }
    }
    self.shared.readable.notify_waiters();
    Ok(())
  }

  /// Receives the next item, waiting while the queue is empty.
  ///
  /// Cancel safe: an item leaves the queue only when this returns it.
  ///
  /// # Errors
  /// Returns `RecvError` once the queue is closed and fully drained.
  pub async fn recv(&self) -> Result<T, RecvError> {
    let mut slot = WaitingReceiver {
      shared: &self.shared,
      registered: false,
    };
    loop {
      let notified = self.shared.readable.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let newly_waiting = {
        let mut state = self.shared.state.lock();
        if let Some(item) = state.take(self.shared.capacity) {
          slot.unregister(&mut state);
          drop(state);
          self.shared.writable.notify_waiters();
          return Ok(item);
        }
        if state.closed {
          slot.unregister(&mut state);
          return Err(RecvError);
        }
        slot.register(&mut state)
      };
      if newly_waiting {
        // A rendezvous sender may be waiting for exactly this.
        self.shared.writable.notify_waiters();
      }
      notified.await;
    }
  }

  /// Receives an item if one is available right now.
  ///
  /// # Errors
  /// `TryRecvError::Empty` if nothing is available yet, `TryRecvError::Exhausted`
  /// if the queue is closed and drained.
  pub fn try_recv(&self) -> Result<T, TryRecvError> {
    let outcome = {
      let mut state = self.shared.state.lock();
      match state.take(self.shared.capacity) {
        Some(item) => Ok(item),
        None if state.closed => Err(TryRecvError::Exhausted),
        None => Err(TryRecvError::Empty),
      }
    };
    if outcome.is_ok() {
      self.shared.writable.notify_waiters();
    }
    outcome
  }

  /// Closes the queue for writing.
  ///
  /// Returns `true` for the call that actually closed it; closing an already
  /// closed queue is a no-op returning `false`.
  pub fn close(&self) -> bool {
    let bounced = {
      let mut state = self.shared.state.lock();
      if state.closed {
        return false;
      }
      state.closed = true;
      // Blocked senders get their items back; completed hand-offs stay deliverable.
      let parked = std::mem::take(&mut state.parked);
      let mut bounced = 0usize;
      for p in parked {
        match p.ticket {
          Some(ticket) => {
            state.bounced.push((ticket, p.item));
            bounced += 1;
          }
          None => state.parked.push_back(p),
        }
      }
      bounced
    };
    debug!(queue = %self.shared.name, bounced, "Queue closed for writing.");
    self.shared.readable.notify_waiters();
    self.shared.writable.notify_waiters();
    true
  }

  pub(crate) fn readable(&self) -> Notified<'_> {
    self.shared.readable.notified()
  }

  pub(crate) fn writable(&self) -> Notified<'_> {
    self.shared.writable.notified()
  }

  /// Counts the caller as a waiting receiver until the returned guard drops.
  pub(crate) fn register_receiver(&self) -> WaitingReceiver<'_, T> {
    let mut slot = WaitingReceiver {
      shared: &self.shared,
      registered: false,
    };
    let newly_waiting = {
      let mut state = self.shared.state.lock();
      slot.register(&mut state)
    };
    if newly_waiting {
      self.shared.writable.notify_waiters();
    }
    slot
  }
}

impl<T> Clone for Queue<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T> fmt::Debug for Queue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.state.lock();
    f.debug_struct("Queue")
      .field("name", &self.shared.name)
      .field("capacity", &self.shared.capacity)
      .field("len", &(state.buffer.len() + state.handoffs()))
      .field("parked_sends", &state.parked.len())
      .field("closed", &state.closed)
      .finish_non_exhaustive()
  }
}

/// Tracks one blocked `send`. Dropping it unsettled withdraws the item.
struct PendingSend<'a, T> {
  shared: &'a Shared<T>,
  ticket: u64,
  settled: bool,
}

impl<T> PendingSend<'_, T> {
  fn settle(&mut self) -> Option<Result<(), SendError<T>>> {
    let mut state = self.shared.state.lock();
    if let Some(item) = state.reclaim_bounced(self.ticket) {
      self.settled = true;
      return Some(Err(SendError(item)));
    }
    if state.is_parked(self.ticket) {
      return None;
    }
    self.settled = true;
    Some(Ok(()))
  }
}

impl<T> Drop for PendingSend<'_, T> {
  fn drop(&mut self) {
    if self.settled {
      return;
    }
    let mut state = self.shared.state.lock();
    if state.withdraw(self.ticket).is_none() {
      let _ = state.reclaim_bounced(self.ticket);
    }
  }
}

/// Membership in a queue's waiting-receiver count.
pub(crate) struct WaitingReceiver<'a, T> {
  shared: &'a Shared<T>,
  registered: bool,
}

impl<T> WaitingReceiver<'_, T> {
  /// Returns `true` if this call added the receiver to the count.
  fn register(&mut self, state: &mut State<T>) -> bool {
    if self.registered {
      return false;
    }
    state.waiting_receivers += 1;
    self.registered = true;
    true
  }

  fn unregister(&mut self, state: &mut State<T>) {
    if self.registered {
      state.waiting_receivers -= 1;
      self.registered = false;
    }
  }
}

impl<T> Drop for WaitingReceiver<'_, T> {
  fn drop(&mut self) {
    if !self.registered {
      return;
    }
    let orphaned = {
      let mut state = self.shared.state.lock();
      self.unregister(&mut state);
      state.handoffs() > state.waiting_receivers
    };
    if orphaned {
      // A hand-off may have been meant for this receiver; let another one claim it.
      trace!(queue = %self.shared.name, "Waiting receiver left with a hand-off pending.");
      self.shared.readable.notify_waiters();
    }
  }
}
