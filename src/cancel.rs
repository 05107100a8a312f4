//! Hierarchical, deadline-aware cancellation.
//!
//! [`CancelToken`] layers a recorded [`CancelCause`] and an optional deadline
//! on top of `tokio_util`'s `CancellationToken`. Cancellation flows from a
//! parent to its children, never the other way round.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Why a token ended up cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelCause {
  /// [`CancelToken::cancel`] was called on the token or one of its ancestors.
  Manual,
  /// The deadline of the token or one of its ancestors elapsed.
  Deadline,
}

/// A broadcast, one-way stop signal.
///
/// Clones observe the same signal. Observing never consumes it: any number of
/// tasks may poll [`is_cancelled`](Self::is_cancelled) or await
/// [`wait_cancelled`](Self::wait_cancelled).
#[derive(Clone)]
pub struct CancelToken {
  shared: Arc<TokenShared>,
}

struct TokenShared {
  token: CancellationToken,
  cause: OnceLock<CancelCause>,
  parent: Option<CancelToken>,
  deadline: Option<Instant>,
  timer: Option<JoinHandle<()>>,
}

impl TokenShared {
  fn trigger(&self, cause: CancelCause) {
    if !self.token.is_cancelled() {
      self.cause.get_or_init(|| cause);
    }
    self.token.cancel();
  }
}

impl Drop for TokenShared {
  fn drop(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.abort();
    }
  }
}

impl CancelToken {
  /// A root token with no deadline.
  pub fn new() -> Self {
    Self::from_parts(None, None)
  }

  /// A root token that cancels itself at `deadline`.
  ///
  /// # Panics
  /// Panics if called outside a Tokio runtime, since the deadline timer is
  /// spawned onto the current runtime.
  pub fn with_deadline(deadline: Instant) -> Self {
    Self::from_parts(None, Some(deadline))
  }

  /// Like [`with_deadline`](Self::with_deadline), with the timer spawned on
  /// `runtime`. Usable from threads that are not inside a runtime.
  pub fn with_deadline_in(runtime: &TokioHandle, deadline: Instant) -> Self {
    Self::from_parts_in(runtime, None, Some(deadline))
  }

  /// A root token that cancels itself once `timeout` has elapsed.
  ///
  /// # Panics
  /// Same as [`with_deadline`](Self::with_deadline).
  pub fn with_timeout(timeout: Duration) -> Self {
    Self::with_deadline(Instant::now() + timeout)
  }

  /// A token cancelled whenever `self` is. Cancelling the child leaves `self` untouched.
  pub fn child_token(&self) -> Self {
    Self::from_parts(Some(self), None)
  }

  /// A child token that additionally cancels itself at `deadline`.
  ///
  /// # Panics
  /// Same as [`with_deadline`](Self::with_deadline).
  pub fn child_with_deadline(&self, deadline: Instant) -> Self {
    Self::from_parts(Some(self), Some(deadline))
  }

  /// Builds a token from an optional parent and an optional deadline.
  ///
  /// # Panics
  /// Panics if `deadline` is set and no Tokio runtime is running. Use
  /// [`from_parts_in`](Self::from_parts_in) to name the runtime explicitly.
  pub fn from_parts(parent: Option<&CancelToken>, deadline: Option<Instant>) -> Self {
    Self::build(parent, deadline, None)
  }

  /// Like [`from_parts`](Self::from_parts), with any deadline timer spawned on `runtime`.
  pub fn from_parts_in(runtime: &TokioHandle, parent: Option<&CancelToken>, deadline: Option<Instant>) -> Self {
    Self::build(parent, deadline, Some(runtime))
  }

  fn build(parent: Option<&CancelToken>, deadline: Option<Instant>, runtime: Option<&TokioHandle>) -> Self {
    let token = match parent {
      Some(parent) => parent.shared.token.child_token(),
      None => CancellationToken::new(),
    };
    let shared = Arc::new_cyclic(|weak: &Weak<TokenShared>| {
      let timer = deadline.map(|at| spawn_deadline_timer(runtime, weak.clone(), token.clone(), at));
      TokenShared {
        token,
        cause: OnceLock::new(),
        parent: parent.cloned(),
        deadline,
        timer,
      }
    });
    Self { shared }
  }

  /// Cancels this token and all its descendants. Idempotent.
  pub fn cancel(&self) {
    trace!("CancelToken: manual cancellation requested.");
    self.shared.trigger(CancelCause::Manual);
  }

  pub fn is_cancelled(&self) -> bool {
    self.shared.token.is_cancelled()
  }

  /// The cause of cancellation, or `None` while the token is still active.
  ///
  /// A token cancelled through an ancestor reports the ancestor's cause. Once
  /// a cause has been reported it never changes.
  pub fn cause(&self) -> Option<CancelCause> {
    if !self.shared.token.is_cancelled() {
      return None;
    }
    let cause = self.shared.cause.get_or_init(|| {
      self
        .shared
        .parent
        .as_ref()
        .and_then(CancelToken::cause)
        .unwrap_or(CancelCause::Manual)
    });
    Some(*cause)
  }

  /// Waits until the token is cancelled and returns why.
  pub async fn wait_cancelled(&self) -> CancelCause {
    self.shared.token.cancelled().await;
    self.cause().unwrap_or(CancelCause::Manual)
  }

  /// The earliest deadline among this token and its ancestors.
  pub fn deadline(&self) -> Option<Instant> {
    let inherited = self.shared.parent.as_ref().and_then(CancelToken::deadline);
    match (self.shared.deadline, inherited) {
      (Some(own), Some(inherited)) => Some(own.min(inherited)),
      (own, inherited) => own.or(inherited),
    }
  }

  /// Time left until the effective deadline; zero once it has passed.
  pub fn time_remaining(&self) -> Option<Duration> {
    self
      .deadline()
      .map(|at| at.saturating_duration_since(Instant::now()))
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for CancelToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelToken")
      .field("cancelled", &self.is_cancelled())
      .field("cause", &self.cause())
      .field("deadline", &self.shared.deadline)
      .field("has_parent", &self.shared.parent.is_some())
      .finish()
  }
}

// The timer holds only a weak reference so it never keeps the token alive.
fn spawn_deadline_timer(
  runtime: Option<&TokioHandle>,
  shared: Weak<TokenShared>,
  token: CancellationToken,
  at: Instant,
) -> JoinHandle<()> {
  let timer = async move {
    tokio::select! {
      _ = token.cancelled() => {
        trace!("Deadline timer stopped: token was cancelled first.");
      }
      _ = tokio::time::sleep_until(at) => {
        if let Some(shared) = shared.upgrade() {
          debug!("Deadline elapsed; cancelling token.");
          shared.trigger(CancelCause::Deadline);
        }
      }
    }
  };
  match runtime {
    Some(handle) => handle.spawn(timer),
    None => tokio::spawn(timer),
  }
}
