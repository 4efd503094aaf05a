use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{TaskError, TaskResult};
use crate::scope::Scope;

lazy_static::lazy_static! {
  static ref NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(0);
}

/// Observable lifecycle of an [`Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
  /// Created but not dispatched (queued behind a limiter, or produced by a
  /// run on an already-cancelled task).
  Idle,
  /// The executor is in flight.
  Running,
  Fulfilled,
  Rejected,
}

enum Settlement<T> {
  Idle,
  Running,
  Fulfilled(T),
  Rejected(TaskError),
}

/// One concrete run of a [`Task`](crate::Task).
///
/// An `Execution` is a cheap-to-clone handle over shared settlement state;
/// any number of holders may await [`Execution::outcome`]. The first
/// settlement wins and is re-delivered to every waiter.
///
/// A cancelled execution never settles: `outcome` stays pending forever.
/// Callers that need to observe cancellation check [`Execution::state`] or
/// race `outcome` against a timer.
pub struct Execution<T> {
  inner: Arc<ExecutionInner<T>>,
}

struct ExecutionInner<T> {
  id: u64,
  scope: Scope,
  settlement: Mutex<Settlement<T>>,
  notify: Notify,
}

impl<T> Execution<T> {
  fn with_settlement(scope: Scope, settlement: Settlement<T>) -> Self {
    Execution {
      inner: Arc::new(ExecutionInner {
        id: NEXT_EXECUTION_ID.fetch_add(1, AtomicOrdering::Relaxed),
        scope,
        settlement: Mutex::new(settlement),
        notify: Notify::new(),
      }),
    }
  }

  /// An execution that has not been dispatched. Stays `Idle` forever unless
  /// something later marks it running and settles it.
  pub(crate) fn idle(scope: Scope) -> Self {
    Self::with_settlement(scope, Settlement::Idle)
  }

  pub(crate) fn running(scope: Scope) -> Self {
    Self::with_settlement(scope, Settlement::Running)
  }

  /// Unique id of this execution, for logging and correlation.
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  /// The composite cancellation scope governing this execution.
  pub fn scope(&self) -> &Scope {
    &self.inner.scope
  }

  pub fn state(&self) -> ExecutionState {
    match &*self.inner.settlement.lock() {
      Settlement::Idle => ExecutionState::Idle,
      Settlement::Running => ExecutionState::Running,
      Settlement::Fulfilled(_) => ExecutionState::Fulfilled,
      Settlement::Rejected(_) => ExecutionState::Rejected,
    }
  }

  pub fn is_settled(&self) -> bool {
    matches!(
      self.state(),
      ExecutionState::Fulfilled | ExecutionState::Rejected
    )
  }

  /// Aborts this execution's scope. Affects only this execution; sibling
  /// executions of the same task keep running.
  pub fn cancel(&self) {
    trace!(execution_id = self.inner.id, "execution cancellation requested");
    self.inner.scope.abort();
  }

  pub(crate) fn mark_running(&self) {
    let mut slot = self.inner.settlement.lock();
    if matches!(*slot, Settlement::Idle) {
      *slot = Settlement::Running;
    }
  }

  pub(crate) fn settle_ok(&self, value: T) {
    if self.settle_with(Settlement::Fulfilled(value)) {
      trace!(execution_id = self.inner.id, "execution fulfilled");
    }
  }

  pub(crate) fn settle_err(&self, error: TaskError) {
    let message = error.to_string();
    if self.settle_with(Settlement::Rejected(error)) {
      debug!(execution_id = self.inner.id, error = %message, "execution rejected");
    }
  }

  /// First settlement wins; later attempts are dropped.
  fn settle_with(&self, settlement: Settlement<T>) -> bool {
    {
      let mut slot = self.inner.settlement.lock();
      if matches!(*slot, Settlement::Fulfilled(_) | Settlement::Rejected(_)) {
        return false;
      }
      *slot = settlement;
    }
    self.inner.notify.notify_waiters();
    true
  }
}

impl<T: Clone + Send + Sync + 'static> Execution<T> {
  /// Waits for this execution to settle and returns its outcome.
  ///
  /// May never return: a cancelled execution stays pending. Race against
  /// `tokio::time::timeout` to bound the wait.
  pub async fn outcome(&self) -> TaskResult<T> {
    loop {
      let notified = self.inner.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if let Some(outcome) = self.try_outcome() {
        return outcome;
      }
      notified.await;
    }
  }

  /// The outcome if already settled, without waiting.
  pub fn try_outcome(&self) -> Option<TaskResult<T>> {
    match &*self.inner.settlement.lock() {
      Settlement::Fulfilled(value) => Some(Ok(value.clone())),
      Settlement::Rejected(error) => Some(Err(error.clone())),
      _ => None,
    }
  }
}

impl<T> Clone for Execution<T> {
  fn clone(&self) -> Self {
    Execution {
      inner: self.inner.clone(),
    }
  }
}
