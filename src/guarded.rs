//! Lock-protected shared state.
//!
//! [`Guarded`] wraps a value in a `parking_lot` mutex and only exposes it
//! through a synchronous closure, so the lock can never be held across an
//! `.await` point. Acquisition is not re-entrant: a thread asking for a lock
//! it already holds gets [`LockError::Reentrant`] instead of deadlocking.

use crate::error::LockError;

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;

lazy_static::lazy_static! {
  static ref NEXT_THREAD_MARK: AtomicU64 = AtomicU64::new(1);
}

thread_local! {
  static THREAD_MARK: Cell<u64> = const { Cell::new(0) };
}

/// A non-zero id unique to the calling thread.
fn current_thread_mark() -> u64 {
  THREAD_MARK.with(|mark| {
    if mark.get() == 0 {
      mark.set(NEXT_THREAD_MARK.fetch_add(1, AtomicOrdering::Relaxed));
    }
    mark.get()
  })
}

/// A value protected by a mutex, accessible only inside a critical section.
pub struct Guarded<V> {
  value: Mutex<V>,
  // Thread mark of the current holder, 0 when unlocked.
  holder: AtomicU64,
}

/// Clears the holder mark when the critical section ends, including by unwinding.
struct HolderMark<'a>(&'a AtomicU64);

impl Drop for HolderMark<'_> {
  fn drop(&mut self) {
    self.0.store(0, AtomicOrdering::Release);
  }
}

impl<V> Guarded<V> {
  pub fn new(value: V) -> Self {
    Self {
      value: Mutex::new(value),
      holder: AtomicU64::new(0),
    }
  }

  /// Runs `f` with exclusive access to the value, blocking until the lock is free.
  ///
  /// # Errors
  /// Returns `LockError::Reentrant` if the calling thread is already inside a
  /// critical section of this same `Guarded`. The value is left untouched.
  pub fn with<T>(&self, f: impl FnOnce(&mut V) -> T) -> Result<T, LockError> {
    if self.holder.load(AtomicOrdering::Acquire) == current_thread_mark() {
      return Err(LockError::Reentrant);
    }
    Ok(self.enter(f))
  }

  /// Like [`with`](Self::with) but never blocks.
  ///
  /// # Errors
  /// `LockError::Reentrant` as for `with`, or `LockError::Contended` if another
  /// thread holds the lock right now.
  pub fn try_with<T>(&self, f: impl FnOnce(&mut V) -> T) -> Result<T, LockError> {
    let me = current_thread_mark();
    if self.holder.load(AtomicOrdering::Acquire) == me {
      return Err(LockError::Reentrant);
    }
    let mut guard = self.value.try_lock().ok_or(LockError::Contended)?;
    self.holder.store(me, AtomicOrdering::Release);
    let _mark = HolderMark(&self.holder);
    Ok(f(&mut guard))
  }

  /// Returns a copy of the value as of the last completed critical section.
  pub fn snapshot(&self) -> Result<V, LockError>
  where
    V: Clone,
  {
    self.with(|value| value.clone())
  }

  pub fn into_inner(self) -> V {
    self.value.into_inner()
  }

  // Callers guarantee `f` cannot reach back into this `Guarded`.
  fn enter<T>(&self, f: impl FnOnce(&mut V) -> T) -> T {
    let mut guard = self.value.lock();
    self.holder.store(current_thread_mark(), AtomicOrdering::Release);
    // Declared after `guard` so the mark is cleared before the lock is released.
    let _mark = HolderMark(&self.holder);
    f(&mut guard)
  }
}

impl<V: Default> Default for Guarded<V> {
  fn default() -> Self {
    Self::new(V::default())
  }
}

impl<V> fmt::Debug for Guarded<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Guarded")
      .field("locked", &self.value.is_locked())
      .finish_non_exhaustive()
  }
}

/// A shared counter whose increments are never lost.
///
/// Every update is a read-add-write performed inside one [`Guarded`]
/// critical section.
#[derive(Debug, Default)]
pub struct Counter {
  inner: Guarded<u64>,
}

impl Counter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds one and returns the new value.
  pub fn increment(&self) -> u64 {
    self.add(1)
  }

  /// Adds `n` and returns the new value.
  pub fn add(&self, n: u64) -> u64 {
    self.inner.enter(|value| {
      *value = value.saturating_add(n);
      *value
    })
  }

  pub fn get(&self) -> u64 {
    self.inner.enter(|value| *value)
  }
}
