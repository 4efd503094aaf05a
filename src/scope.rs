use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

type AbortListener = Box<dyn FnOnce() + Send>;

enum ListenerSlot {
  Armed(Vec<AbortListener>),
  Consumed,
}

/// A node in the cancellation tree.
///
/// A `Scope` is a cheap-to-clone handle; clones observe the same abort state.
/// Aborting is monotonic and idempotent: the first `abort` delivers every
/// registered listener synchronously, in registration order, and marks them
/// consumed. Listeners registered after the abort are invoked immediately on
/// the registering call stack, so no notification is ever missed.
///
/// Async code waits on a scope through [`Scope::cancelled`], which is backed
/// by a [`CancellationToken`].
pub struct Scope {
  inner: Arc<ScopeInner>,
}

struct ScopeInner {
  token: CancellationToken,
  listeners: Mutex<ListenerSlot>,
}

impl Scope {
  pub fn new() -> Self {
    Scope {
      inner: Arc::new(ScopeInner {
        token: CancellationToken::new(),
        listeners: Mutex::new(ListenerSlot::Armed(Vec::new())),
      }),
    }
  }

  /// Whether this scope has been aborted. Never reverts to `false`.
  pub fn is_aborted(&self) -> bool {
    self.inner.token.is_cancelled()
  }

  /// Aborts this scope. No-op if already aborted.
  ///
  /// Listeners run synchronously in registration order. A panicking listener
  /// is isolated and logged; the remaining listeners still run.
  pub fn abort(&self) {
    let drained = {
      let mut slot = self.inner.listeners.lock();
      match &mut *slot {
        ListenerSlot::Consumed => return,
        ListenerSlot::Armed(listeners) => {
          let drained = std::mem::take(listeners);
          *slot = ListenerSlot::Consumed;
          self.inner.token.cancel();
          drained
        }
      }
    };
    trace!(listener_count = drained.len(), "scope aborted");
    for listener in drained {
      Self::deliver(listener);
    }
  }

  /// Registers a listener to run when this scope aborts.
  ///
  /// If the scope is already aborted the listener is invoked immediately, on
  /// the current call stack.
  pub fn on_abort(&self, listener: impl FnOnce() + Send + 'static) {
    let listener: AbortListener = Box::new(listener);
    {
      let mut slot = self.inner.listeners.lock();
      if let ListenerSlot::Armed(listeners) = &mut *slot {
        listeners.push(listener);
        return;
      }
    }
    Self::deliver(listener);
  }

  /// Links this scope to `other`: aborting `other` aborts this scope.
  ///
  /// Propagation is one-directional; aborting this scope leaves `other`
  /// untouched. If `other` is already aborted, this scope is aborted
  /// immediately.
  pub fn link(&self, other: &Scope) {
    let target = self.clone();
    other.on_abort(move || target.abort());
  }

  /// Resolves once this scope is aborted.
  pub async fn cancelled(&self) {
    self.inner.token.cancelled().await;
  }

  /// Composite scope for one execution: a fresh scope that aborts when the
  /// task's root scope aborts, and when the caller-supplied override scope
  /// (if any) aborts.
  pub(crate) fn derived(task_scope: &Scope, override_scope: Option<&Scope>) -> Scope {
    let scope = Scope::new();
    scope.link(task_scope);
    if let Some(override_scope) = override_scope {
      scope.link(override_scope);
    }
    scope
  }

  pub(crate) fn ptr_eq(&self, other: &Scope) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  fn deliver(listener: AbortListener) {
    if catch_unwind(AssertUnwindSafe(listener)).is_err() {
      error!("abort listener panicked; remaining listeners are unaffected");
    }
  }
}

impl Clone for Scope {
  fn clone(&self) -> Self {
    Scope {
      inner: self.inner.clone(),
    }
  }
}

impl Default for Scope {
  fn default() -> Self {
    Self::new()
  }
}
