use futures_cadence::Scope;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

// Helper to initialize tracing for tests
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_cadence=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[test]
fn test_abort_fires_listeners_once_in_registration_order() {
  setup_tracing_for_test();
  let scope = Scope::new();
  let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

  for value in 1..=3 {
    let order_clone = order.clone();
    scope.on_abort(move || order_clone.lock().push(value));
  }

  assert!(!scope.is_aborted());
  scope.abort();
  scope.abort(); // Idempotent; listeners must not fire again.

  assert!(scope.is_aborted());
  assert_eq!(*order.lock(), vec![1, 2, 3]);
}

#[test]
fn test_listener_registered_after_abort_fires_immediately() {
  setup_tracing_for_test();
  let scope = Scope::new();
  scope.abort();

  let fired = Arc::new(AtomicBool::new(false));
  let fired_clone = fired.clone();
  scope.on_abort(move || fired_clone.store(true, Ordering::SeqCst));

  // Delivered on the registering call stack, not deferred.
  assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_link_propagates_parent_to_child_only() {
  setup_tracing_for_test();
  let parent = Scope::new();
  let child = Scope::new();
  child.link(&parent);

  parent.abort();
  assert!(child.is_aborted(), "aborting the linked scope must abort this one");

  let parent2 = Scope::new();
  let child2 = Scope::new();
  child2.link(&parent2);

  child2.abort();
  assert!(
    !parent2.is_aborted(),
    "abort must not travel against the link direction"
  );
}

#[test]
fn test_link_to_already_aborted_scope_aborts_immediately() {
  setup_tracing_for_test();
  let parent = Scope::new();
  parent.abort();

  let child = Scope::new();
  child.link(&parent);
  assert!(child.is_aborted());
}

#[test]
fn test_panicking_listener_does_not_block_remaining_listeners() {
  setup_tracing_for_test();
  let scope = Scope::new();
  let survivor_fired = Arc::new(AtomicBool::new(false));

  scope.on_abort(|| panic!("listener intentionally panicked"));
  let survivor_clone = survivor_fired.clone();
  scope.on_abort(move || survivor_clone.store(true, Ordering::SeqCst));

  scope.abort();
  assert!(
    survivor_fired.load(Ordering::SeqCst),
    "listener after the panicking one must still run"
  );
}

#[test]
fn test_linked_scopes_abort_exactly_once() {
  setup_tracing_for_test();
  // A scope linked to two parents aborts once, no matter how many of its
  // links fire.
  let parent_a = Scope::new();
  let parent_b = Scope::new();
  let child = Scope::new();
  child.link(&parent_a);
  child.link(&parent_b);

  let fire_count = Arc::new(AtomicUsize::new(0));
  let fire_count_clone = fire_count.clone();
  child.on_abort(move || {
    fire_count_clone.fetch_add(1, Ordering::SeqCst);
  });

  parent_a.abort();
  parent_b.abort();
  assert_eq!(fire_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_resolves_once_aborted() {
  setup_tracing_for_test();
  let scope = Scope::new();

  let scope_for_abort = scope.clone();
  tokio::spawn(async move {
    sleep(Duration::from_millis(50)).await;
    scope_for_abort.abort();
  });

  scope.cancelled().await;
  assert!(scope.is_aborted());
}
