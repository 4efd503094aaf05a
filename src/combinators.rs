//! Functional combinators over [`Task`].
//!
//! Every combinator returns a new task wrapping the source's executions: the
//! source is never invoked eagerly, and the governing scope is propagated
//! into every nested run. Side-effect callbacks (`tap`, `tap_error`,
//! `finally`) are isolated; a panicking callback is logged and never replaces
//! the primary outcome.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::error::TaskError;
use crate::task::Task;

fn isolate_side_effect(effect: impl FnOnce(), context: &'static str) {
  if catch_unwind(AssertUnwindSafe(effect)).is_err() {
    let err = TaskError::SideEffect(format!("{context} callback panicked"));
    error!(%err, "side effect isolated; primary outcome preserved");
  }
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
  /// Applies `f` to the fulfilment value.
  pub fn map<U>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
  {
    let source = self.clone();
    let f = Arc::new(f);
    Task::new(move |cx| {
      let source = source.clone();
      let f = f.clone();
      async move {
        let value = source.run_in(cx.scope()).outcome().await?;
        Ok(f(value))
      }
    })
  }

  /// Chains a dependent task produced from the fulfilment value.
  pub fn flat_map<U>(&self, f: impl Fn(T) -> Task<U> + Send + Sync + 'static) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
  {
    let source = self.clone();
    let f = Arc::new(f);
    Task::new(move |cx| {
      let source = source.clone();
      let f = f.clone();
      async move {
        let value = source.run_in(cx.scope()).outcome().await?;
        f(value).run_in(cx.scope()).outcome().await
      }
    })
  }

  /// Transforms both outcomes without changing which one occurred.
  pub fn bimap<U>(
    &self,
    on_fulfilled: impl Fn(T) -> U + Send + Sync + 'static,
    on_rejected: impl Fn(TaskError) -> TaskError + Send + Sync + 'static,
  ) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
  {
    let source = self.clone();
    let on_fulfilled = Arc::new(on_fulfilled);
    let on_rejected = Arc::new(on_rejected);
    Task::new(move |cx| {
      let source = source.clone();
      let on_fulfilled = on_fulfilled.clone();
      let on_rejected = on_rejected.clone();
      async move {
        match source.run_in(cx.scope()).outcome().await {
          Ok(value) => Ok(on_fulfilled(value)),
          Err(error) => Err(on_rejected(error)),
        }
      }
    })
  }

  /// Observes the fulfilment value. The callback is isolated: a panic inside
  /// it is logged and the value passes through unchanged.
  pub fn tap(&self, effect: impl Fn(&T) + Send + Sync + 'static) -> Task<T> {
    let source = self.clone();
    let effect = Arc::new(effect);
    Task::new(move |cx| {
      let source = source.clone();
      let effect = effect.clone();
      async move {
        let value = source.run_in(cx.scope()).outcome().await?;
        isolate_side_effect(|| effect(&value), "tap");
        Ok(value)
      }
    })
  }

  /// Observes a rejection. Logs but never replaces the original error.
  pub fn tap_error(&self, effect: impl Fn(&TaskError) + Send + Sync + 'static) -> Task<T> {
    let source = self.clone();
    let effect = Arc::new(effect);
    Task::new(move |cx| {
      let source = source.clone();
      let effect = effect.clone();
      async move {
        match source.run_in(cx.scope()).outcome().await {
          Ok(value) => Ok(value),
          Err(error) => {
            isolate_side_effect(|| effect(&error), "tap_error");
            Err(error)
          }
        }
      }
    })
  }

  /// Recovers from a rejection with a synchronously computed value.
  pub fn catch_error(&self, recover: impl Fn(TaskError) -> T + Send + Sync + 'static) -> Task<T> {
    let source = self.clone();
    let recover = Arc::new(recover);
    Task::new(move |cx| {
      let source = source.clone();
      let recover = recover.clone();
      async move {
        match source.run_in(cx.scope()).outcome().await {
          Ok(value) => Ok(value),
          Err(error) => Ok(recover(error)),
        }
      }
    })
  }

  /// Recovers from a rejection by running a fallback task derived from the
  /// error.
  pub fn or_else(&self, recover: impl Fn(TaskError) -> Task<T> + Send + Sync + 'static) -> Task<T> {
    let source = self.clone();
    let recover = Arc::new(recover);
    Task::new(move |cx| {
      let source = source.clone();
      let recover = recover.clone();
      async move {
        match source.run_in(cx.scope()).outcome().await {
          Ok(value) => Ok(value),
          Err(error) => recover(error).run_in(cx.scope()).outcome().await,
        }
      }
    })
  }

  /// Runs `fallback` if this task rejects.
  pub fn fallback_to(&self, fallback: &Task<T>) -> Task<T> {
    let fallback = fallback.clone();
    self.or_else(move |_error| fallback.clone())
  }

  /// Branches on the fulfilment value.
  pub fn if_else<U>(
    &self,
    predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    on_true: impl Fn(T) -> Task<U> + Send + Sync + 'static,
    on_false: impl Fn(T) -> Task<U> + Send + Sync + 'static,
  ) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
  {
    let source = self.clone();
    let predicate = Arc::new(predicate);
    let on_true = Arc::new(on_true);
    let on_false = Arc::new(on_false);
    Task::new(move |cx| {
      let source = source.clone();
      let predicate = predicate.clone();
      let on_true = on_true.clone();
      let on_false = on_false.clone();
      async move {
        let value = source.run_in(cx.scope()).outcome().await?;
        let branch = if predicate(&value) {
          on_true(value)
        } else {
          on_false(value)
        };
        branch.run_in(cx.scope()).outcome().await
      }
    })
  }

  /// Collapses both outcomes into a single fulfilment.
  pub fn fold<U>(
    &self,
    on_rejected: impl Fn(TaskError) -> U + Send + Sync + 'static,
    on_fulfilled: impl Fn(T) -> U + Send + Sync + 'static,
  ) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
  {
    let source = self.clone();
    let on_rejected = Arc::new(on_rejected);
    let on_fulfilled = Arc::new(on_fulfilled);
    Task::new(move |cx| {
      let source = source.clone();
      let on_rejected = on_rejected.clone();
      let on_fulfilled = on_fulfilled.clone();
      async move {
        match source.run_in(cx.scope()).outcome().await {
          Ok(value) => Ok(on_fulfilled(value)),
          Err(error) => Ok(on_rejected(error)),
        }
      }
    })
  }

  /// Runs `effect` after settlement, either way. Isolated like [`Task::tap`].
  pub fn finally(&self, effect: impl Fn() + Send + Sync + 'static) -> Task<T> {
    let source = self.clone();
    let effect = Arc::new(effect);
    Task::new(move |cx| {
      let source = source.clone();
      let effect = effect.clone();
      async move {
        let outcome = source.run_in(cx.scope()).outcome().await;
        isolate_side_effect(|| effect(), "finally");
        outcome
      }
    })
  }

  /// Runs this task and `other` concurrently; fulfils with the pair once
  /// both settle successfully.
  ///
  /// Rejects as soon as either side rejects. The still-running sibling is
  /// left to complete on its own; its result is discarded.
  pub fn zip<U>(&self, other: &Task<U>) -> Task<(T, U)>
  where
    U: Clone + Send + Sync + 'static,
  {
    self.zip_with(other, |left, right| (left, right))
  }

  /// [`Task::zip`] with a combining function.
  pub fn zip_with<U, R>(
    &self,
    other: &Task<U>,
    combine: impl Fn(T, U) -> R + Send + Sync + 'static,
  ) -> Task<R>
  where
    U: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
  {
    let left = self.clone();
    let right = other.clone();
    let combine = Arc::new(combine);
    Task::new(move |cx| {
      let left = left.clone();
      let right = right.clone();
      let combine = combine.clone();
      async move {
        let left_execution = left.run_in(cx.scope());
        let right_execution = right.run_in(cx.scope());
        let (left_value, right_value) =
          futures::future::try_join(left_execution.outcome(), right_execution.outcome()).await?;
        Ok(combine(left_value, right_value))
      }
    })
  }
}
