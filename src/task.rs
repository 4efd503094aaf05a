use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace, Instrument};

use crate::context::TaskContext;
use crate::error::{TaskError, TaskResult};
use crate::execution::{Execution, ExecutionState};
use crate::scope::Scope;

/// The boxed future an executor produces for one execution.
pub type ExecutorFuture<T> = Pin<Box<dyn Future<Output = TaskResult<T>> + Send + 'static>>;

pub(crate) type ExecutorFn<T> = Arc<dyn Fn(TaskContext) -> ExecutorFuture<T> + Send + Sync>;

/// A run interceptor: combinators that must control the run step itself
/// (throttle, memoize, limiter wrappers) receive the task's root scope and
/// the caller-supplied override scope and produce the execution directly.
pub(crate) type InterceptFn<T> = Arc<dyn Fn(&Scope, Option<&Scope>) -> Execution<T> + Send + Sync>;

pub(crate) enum TaskKind<T> {
  Executor(ExecutorFn<T>),
  Intercept(InterceptFn<T>),
}

pub(crate) struct MemoState<T> {
  pub(crate) catch_errors: bool,
  pub(crate) cached: Mutex<Option<Execution<T>>>,
}

/// Debounced tasks share one pending-timer slot, owned by the original
/// (non-debounced) source. Re-debouncing re-targets the original instead of
/// nesting delays.
pub(crate) struct DebounceLink<T> {
  pub(crate) original: Task<T>,
  pub(crate) pending: Arc<Mutex<Option<Scope>>>,
}

pub(crate) struct TaskInner<T> {
  pub(crate) scope: Scope,
  pub(crate) kind: TaskKind<T>,
  pub(crate) name: Mutex<Option<Arc<str>>>,
  pub(crate) memo: Option<MemoState<T>>,
  pub(crate) debounce: Option<DebounceLink<T>>,
}

/// An immutable, reusable, lazy definition of an asynchronous computation.
///
/// Constructing a task never invokes its executor. Every call to
/// [`Task::run`] produces a fresh [`Execution`] bound to a composite scope
/// linking the task's root scope and an optional caller-supplied override
/// scope, so cancelling the task cancels every execution derived from it,
/// while cancelling one execution's override leaves its siblings alone.
///
/// `Task` is a cheap-to-clone handle; combinators return new tasks and never
/// mutate their source.
///
/// Executions are spawned onto the ambient Tokio runtime, so `run` must be
/// called from within one.
pub struct Task<T> {
  pub(crate) inner: Arc<TaskInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
  /// Creates a task from an executor.
  ///
  /// The executor is called once per execution with that execution's
  /// [`TaskContext`] and returns the future to run.
  pub fn new<F, Fut>(executor: F) -> Self
  where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
  {
    Self::from_parts(
      TaskKind::Executor(Arc::new(move |cx| Box::pin(executor(cx)))),
      None,
      None,
    )
  }

  /// A task that fulfils immediately with `value`.
  pub fn of(value: T) -> Self {
    Task::new(move |_cx| {
      let value = value.clone();
      async move { Ok(value) }
    })
  }

  /// Alias for [`Task::of`].
  pub fn resolve(value: T) -> Self {
    Self::of(value)
  }

  /// A task that rejects immediately with `error`.
  pub fn reject(error: TaskError) -> Self {
    Task::new(move |_cx| {
      let error = error.clone();
      async move { Err(error) }
    })
  }

  /// Runs this task, producing a fresh execution (or a cached one when
  /// memoized).
  pub fn run(&self) -> Execution<T> {
    self.run_scoped(None)
  }

  /// Runs this task under an additional caller-supplied scope: aborting
  /// `scope` cancels this execution only.
  pub fn run_in(&self, scope: &Scope) -> Execution<T> {
    self.run_scoped(Some(scope))
  }

  fn run_scoped(&self, override_scope: Option<&Scope>) -> Execution<T> {
    if let Some(memo) = &self.inner.memo {
      let mut cached = memo.cached.lock();
      if let Some(execution) = cached.as_ref() {
        if !Self::memo_invalidated(memo, execution) {
          trace!(execution_id = execution.id(), "memoized execution reused");
          return execution.clone();
        }
      }
      let execution = self.launch(override_scope);
      *cached = Some(execution.clone());
      return execution;
    }
    self.launch(override_scope)
  }

  fn launch(&self, override_scope: Option<&Scope>) -> Execution<T> {
    if self.inner.scope.is_aborted() {
      trace!(
        task = self.display_name().as_ref(),
        "run on a cancelled task; executor not invoked"
      );
      return Execution::idle(Scope::derived(&self.inner.scope, override_scope));
    }

    match &self.inner.kind {
      TaskKind::Intercept(intercept) => intercept(&self.inner.scope, override_scope),
      TaskKind::Executor(executor) => {
        let scope = Scope::derived(&self.inner.scope, override_scope);
        if scope.is_aborted() {
          return Execution::idle(scope);
        }

        let execution = Execution::running(scope.clone());
        let future = executor(TaskContext::new(scope.clone()));
        let settle = execution.clone();
        let span = tracing::info_span!(
          "task_execution",
          task = self.display_name().as_ref(),
          execution_id = execution.id()
        );

        tokio::spawn(
          async move {
            tokio::select! {
              biased;
              _ = scope.cancelled() => {
                trace!("execution aborted before settling");
              }
              result = AssertUnwindSafe(future).catch_unwind() => {
                match result {
                  Ok(Ok(value)) => settle.settle_ok(value),
                  Ok(Err(error)) => settle.settle_err(error),
                  Err(_panic) => settle.settle_err(TaskError::Panicked),
                }
              }
            }
          }
          .instrument(span),
        );

        execution
      }
    }
  }

  /// Caches the first execution: subsequent runs return it unchanged while
  /// it is alive. A rejected settlement invalidates the cache, so the next
  /// run retries from scratch; use [`Task::memoize_catching`] to cache
  /// rejections too. An aborted cached execution is also re-run.
  pub fn memoize(&self) -> Task<T> {
    self.memoize_with(false)
  }

  /// Like [`Task::memoize`], but a rejected settlement is cached as well.
  pub fn memoize_catching(&self) -> Task<T> {
    self.memoize_with(true)
  }

  fn memoize_with(&self, catch_errors: bool) -> Task<T> {
    let source = self.clone();
    Self::from_parts(
      TaskKind::Intercept(Arc::new(move |root, override_scope| {
        let scope = Scope::derived(root, override_scope);
        source.run_in(&scope)
      })),
      Some(MemoState {
        catch_errors,
        cached: Mutex::new(None),
      }),
      None,
    )
  }

  fn memo_invalidated(memo: &MemoState<T>, execution: &Execution<T>) -> bool {
    if execution.scope().is_aborted() {
      return true;
    }
    !memo.catch_errors && execution.state() == ExecutionState::Rejected
  }

  pub(crate) fn from_parts(
    kind: TaskKind<T>,
    memo: Option<MemoState<T>>,
    debounce: Option<DebounceLink<T>>,
  ) -> Self {
    Task {
      inner: Arc::new(TaskInner {
        scope: Scope::new(),
        kind,
        name: Mutex::new(None),
        memo,
        debounce,
      }),
    }
  }

  pub(crate) fn from_intercept(intercept: InterceptFn<T>) -> Self {
    Self::from_parts(TaskKind::Intercept(intercept), None, None)
  }
}

impl<T> Task<T> {
  /// Cancels this task: aborts the root scope, which transitively aborts
  /// every execution derived from it. Idempotent; eager cancel listeners
  /// fire exactly once total.
  pub fn cancel(&self) {
    debug!(task = self.display_name().as_ref(), "task cancelled");
    self.inner.scope.abort();
  }

  /// Registers an eager cancel listener and returns the same task for
  /// chaining. The listener fires as soon as the task is cancelled, whether
  /// or not any execution was ever started; registering after cancellation
  /// fires it immediately.
  pub fn on_cancel(self, listener: impl FnOnce() + Send + 'static) -> Self {
    self.inner.scope.on_abort(listener);
    self
  }

  /// The task's root cancellation scope.
  pub fn scope(&self) -> &Scope {
    &self.inner.scope
  }

  /// Names this task for tracing spans and returns it for chaining.
  pub fn with_name(self, name: impl Into<Arc<str>>) -> Self {
    *self.inner.name.lock() = Some(name.into());
    self
  }

  pub fn name(&self) -> Option<Arc<str>> {
    self.inner.name.lock().clone()
  }

  fn display_name(&self) -> Arc<str> {
    self
      .name()
      .unwrap_or_else(|| Arc::from("anonymous"))
  }
}

impl<T> Clone for Task<T> {
  fn clone(&self) -> Self {
    Task {
      inner: self.inner.clone(),
    }
  }
}
