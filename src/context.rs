use std::time::Duration;

use crate::scope::Scope;

/// Capabilities handed to an executor for one execution.
///
/// Carries the execution's composite cancellation scope. Cancellation is
/// cooperative: an executor that never looks at its context runs to
/// completion, but it is dropped at its next await point once the scope
/// aborts.
#[derive(Clone)]
pub struct TaskContext {
  scope: Scope,
}

impl TaskContext {
  pub(crate) fn new(scope: Scope) -> Self {
    TaskContext { scope }
  }

  pub fn scope(&self) -> &Scope {
    &self.scope
  }

  pub fn is_cancelled(&self) -> bool {
    self.scope.is_aborted()
  }

  /// Resolves once this execution's scope aborts.
  pub async fn cancelled(&self) {
    self.scope.cancelled().await;
  }

  pub async fn sleep(&self, duration: Duration) {
    tokio::time::sleep(duration).await;
  }

  /// Registers a listener that fires when *this execution* is cancelled.
  ///
  /// Distinct from [`Task::on_cancel`](crate::Task::on_cancel): that one fires
  /// on task cancellation even if no execution was ever started, while this
  /// one only exists for an execution that actually began.
  pub fn on_cancel(&self, listener: impl FnOnce() + Send + 'static) {
    self.scope.on_abort(listener);
  }
}
