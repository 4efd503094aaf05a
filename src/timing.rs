//! Time-shaping combinators: delay, timeout, retry with backoff, and the
//! debounce/throttle rate shapers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::TaskError;
use crate::execution::Execution;
use crate::scope::Scope;
use crate::task::{DebounceLink, Task, TaskKind};

/// Retry schedule: total attempt count, inter-attempt delay, exponential
/// backoff factor, and an optional predicate consulted before each retry.
#[derive(Clone)]
pub struct RetryPolicy {
  attempts: usize,
  delay: Duration,
  backoff_factor: f64,
  should_retry: Option<Arc<dyn Fn(&TaskError, usize) -> bool + Send + Sync>>,
}

impl RetryPolicy {
  /// A policy with `attempts` total attempts, no delay and no backoff.
  pub fn attempts(attempts: usize) -> Self {
    RetryPolicy {
      attempts: attempts.max(1),
      delay: Duration::ZERO,
      backoff_factor: 1.0,
      should_retry: None,
    }
  }

  /// Base delay between a failed attempt and the next one.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  /// Multiplies the delay by `factor^attempt`: attempt 0 waits `delay`,
  /// attempt 1 waits `delay × factor`, and so on.
  pub fn with_backoff_factor(mut self, factor: f64) -> Self {
    self.backoff_factor = factor;
    self
  }

  /// Consulted with the error and the zero-based attempt index after each
  /// failure; returning `false` stops retrying and rejects with that error.
  pub fn with_should_retry(
    mut self,
    predicate: impl Fn(&TaskError, usize) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.should_retry = Some(Arc::new(predicate));
    self
  }

  fn backoff_delay(&self, attempt: usize) -> Duration {
    self.delay.mul_f64(self.backoff_factor.powi(attempt as i32))
  }
}

struct ThrottleEntry<T> {
  started: Instant,
  execution: Execution<T>,
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
  /// Waits `duration`, then runs the source.
  pub fn delay(&self, duration: Duration) -> Task<T> {
    let source = self.clone();
    Task::new(move |cx| {
      let source = source.clone();
      async move {
        cx.sleep(duration).await;
        source.run_in(cx.scope()).outcome().await
      }
    })
  }

  /// Races the source against a timer. Whichever loses is cancelled: a timer
  /// win cancels the in-flight execution and rejects with
  /// [`TaskError::Timeout`].
  pub fn timeout(&self, limit: Duration) -> Task<T> {
    let source = self.clone();
    Task::new(move |cx| {
      let source = source.clone();
      async move {
        let execution = source.run_in(cx.scope());
        let watchdog = execution.clone();
        tokio::select! {
          biased;
          outcome = execution.outcome() => outcome,
          _ = tokio::time::sleep(limit) => {
            warn!(
              execution_id = watchdog.id(),
              limit_ms = limit.as_millis() as u64,
              "execution timed out; cancelling"
            );
            watchdog.cancel();
            Err(TaskError::Timeout(limit))
          }
        }
      }
    })
  }

  /// Retries up to `attempts` total attempts with no delay between them.
  pub fn retry(&self, attempts: usize) -> Task<T> {
    self.retry_with(RetryPolicy::attempts(attempts))
  }

  /// Retries according to `policy`. Each attempt is a fresh run of the
  /// source; the first success settles, and the last failure's error is the
  /// rejection.
  pub fn retry_with(&self, policy: RetryPolicy) -> Task<T> {
    let source = self.clone();
    Task::new(move |cx| {
      let source = source.clone();
      let policy = policy.clone();
      async move {
        let mut attempt = 0;
        loop {
          match source.run_in(cx.scope()).outcome().await {
            Ok(value) => return Ok(value),
            Err(error) => {
              if let Some(should_retry) = &policy.should_retry {
                if !should_retry(&error, attempt) {
                  debug!(attempt, "retry predicate declined; rejecting");
                  return Err(error);
                }
              }
              if attempt + 1 >= policy.attempts {
                return Err(error);
              }
              let wait = policy.backoff_delay(attempt);
              debug!(
                attempt,
                wait_ms = wait.as_millis() as u64,
                "attempt failed; backing off"
              );
              if !wait.is_zero() {
                cx.sleep(wait).await;
              }
              attempt += 1;
            }
          }
        }
      }
    })
  }

  /// Delays execution until `quiet_period` has elapsed without another run.
  ///
  /// Each `run` supersedes any pending timer: the superseded execution is
  /// aborted and never settles. The pending-timer slot is owned by the
  /// original, non-debounced source, so debouncing an already-debounced task
  /// re-targets that original — `.debounce(a).debounce(b)` behaves exactly
  /// like `.debounce(b)`. Cancelling the task clears the pending timer
  /// without running the source.
  pub fn debounce(&self, quiet_period: Duration) -> Task<T> {
    let (original, pending) = match &self.inner.debounce {
      Some(link) => (link.original.clone(), link.pending.clone()),
      None => (self.clone(), Arc::new(Mutex::new(None))),
    };

    let source = original.clone();
    let slot = pending.clone();
    let intercept = move |root: &Scope, override_scope: Option<&Scope>| {
      let scope = Scope::derived(root, override_scope);
      if scope.is_aborted() {
        return Execution::idle(scope);
      }

      // Claim the timer slot synchronously so supersession follows run order.
      let superseded = { slot.lock().replace(scope.clone()) };
      if let Some(previous) = superseded {
        trace!("debounced run supersedes a pending timer");
        previous.abort();
      }

      let execution = Execution::running(scope.clone());
      let settle = execution.clone();
      let source = source.clone();
      let slot = slot.clone();
      tokio::spawn(async move {
        tokio::select! {
          biased;
          _ = scope.cancelled() => {
            trace!("debounced run aborted before firing");
          }
          outcome = async {
            tokio::time::sleep(quiet_period).await;
            {
              let mut pending = slot.lock();
              if pending.as_ref().is_some_and(|owner| owner.ptr_eq(&scope)) {
                *pending = None;
              }
            }
            source.run_in(&scope).outcome().await
          } => {
            match outcome {
              Ok(value) => settle.settle_ok(value),
              Err(error) => settle.settle_err(error),
            }
          }
        }
      });

      execution
    };

    Task::from_parts(
      TaskKind::Intercept(Arc::new(intercept)),
      None,
      Some(DebounceLink { original, pending }),
    )
  }

  /// Caps the execution rate: a run inside a hot window returns the cached
  /// execution unchanged, including its eventual error. A run on a cold
  /// window starts a fresh execution and re-stamps the window.
  pub fn throttle(&self, window: Duration) -> Task<T> {
    let source = self.clone();
    let state: Arc<Mutex<Option<ThrottleEntry<T>>>> = Arc::new(Mutex::new(None));
    Task::from_intercept(Arc::new(move |root, override_scope| {
      let mut entry = state.lock();
      if let Some(cached) = entry.as_ref() {
        if cached.started.elapsed() < window {
          trace!(
            execution_id = cached.execution.id(),
            "throttle window hot; returning cached execution"
          );
          return cached.execution.clone();
        }
      }
      let scope = Scope::derived(root, override_scope);
      let execution = source.run_in(&scope);
      *entry = Some(ThrottleEntry {
        started: Instant::now(),
        execution: execution.clone(),
      });
      execution
    }))
  }
}
