use std::time::Duration;

use thiserror::Error;

/// Errors produced by tasks and their combinators.
///
/// Errors are `Clone` because a settled `Execution` may hand its outcome to
/// any number of callers (memoized and throttled tasks re-deliver the same
/// settlement).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
  /// The wrapped computation rejected.
  #[error("execution failed: {0}")]
  Execution(String),

  /// The executor future panicked while running.
  #[error("task panicked during execution")]
  Panicked,

  /// A race against a timer was lost.
  #[error("task timed out after {0:?}")]
  Timeout(Duration),

  /// Every alternative in an `any` group rejected. Carries the underlying
  /// errors in input order.
  #[error("all {} alternatives failed", .0.len())]
  Aggregate(Vec<TaskError>),

  /// A side-effect callback (tap, cancel listener, limiter hook) failed.
  /// Never surfaces in place of a primary outcome; only logged.
  #[error("side effect callback failed: {0}")]
  SideEffect(String),
}

impl TaskError {
  /// Shorthand for `TaskError::Execution` with any displayable message.
  pub fn execution(message: impl Into<String>) -> Self {
    TaskError::Execution(message.into())
  }
}

impl From<&str> for TaskError {
  fn from(message: &str) -> Self {
    TaskError::Execution(message.to_string())
  }
}

impl From<String> for TaskError {
  fn from(message: String) -> Self {
    TaskError::Execution(message)
  }
}

/// Outcome of a settled execution.
pub type TaskResult<T> = Result<T, TaskError>;
