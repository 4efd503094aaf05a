use futures_cadence::{RetryPolicy, Task, TaskError};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};

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

fn failing_task(message: &str) -> Task<i32> {
  Task::reject(TaskError::execution(message))
}

#[tokio::test]
async fn test_map_and_flat_map_chain_lazily() {
  setup_tracing_for_test();
  let invocations = Arc::new(AtomicUsize::new(0));
  let invocations_clone = invocations.clone();
  let source = Task::new(move |_cx| {
    let invocations = invocations_clone.clone();
    async move {
      invocations.fetch_add(1, Ordering::SeqCst);
      Ok(10)
    }
  });

  let mapped = source.map(|n| n + 1).flat_map(|n| Task::of(n * 2));
  assert_eq!(invocations.load(Ordering::SeqCst), 0, "combinators must stay lazy");

  assert_eq!(mapped.run().outcome().await, Ok(22));
  assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bimap_transforms_both_outcomes() {
  setup_tracing_for_test();
  let ok = Task::of(2).bimap(|n| n * 10, |e| e);
  assert_eq!(ok.run().outcome().await, Ok(20));

  let err = failing_task("boom").bimap(
    |n| n,
    |_e| TaskError::execution("rewritten"),
  );
  assert_eq!(
    err.run().outcome().await,
    Err(TaskError::Execution("rewritten".to_string()))
  );
}

#[tokio::test]
async fn test_tap_panic_is_isolated() {
  setup_tracing_for_test();
  let observed = Arc::new(AtomicUsize::new(0));
  let observed_clone = observed.clone();

  let task = Task::of(5)
    .tap(|_value| panic!("tap intentionally panicked"))
    .tap(move |value| {
      observed_clone.store(*value as usize, Ordering::SeqCst);
    });

  assert_eq!(task.run().outcome().await, Ok(5));
  assert_eq!(observed.load(Ordering::SeqCst), 5, "later taps still observe the value");
}

#[tokio::test]
async fn test_tap_error_preserves_original_error() {
  setup_tracing_for_test();
  let observed = Arc::new(parking_lot::Mutex::new(None));
  let observed_clone = observed.clone();

  let task = failing_task("original").tap_error(move |error| {
    *observed_clone.lock() = Some(error.clone());
  });

  assert_eq!(
    task.run().outcome().await,
    Err(TaskError::Execution("original".to_string()))
  );
  assert_eq!(
    *observed.lock(),
    Some(TaskError::Execution("original".to_string()))
  );
}

#[tokio::test]
async fn test_recovery_combinators() {
  setup_tracing_for_test();
  let recovered = failing_task("x").catch_error(|_e| 99);
  assert_eq!(recovered.run().outcome().await, Ok(99));

  let or_else = failing_task("x").or_else(|_e| Task::of(7));
  assert_eq!(or_else.run().outcome().await, Ok(7));

  let fallback = failing_task("x").fallback_to(&Task::of(3));
  assert_eq!(fallback.run().outcome().await, Ok(3));

  let folded = failing_task("x").fold(|_e| "rejected".to_string(), |n| format!("got {n}"));
  assert_eq!(folded.run().outcome().await, Ok("rejected".to_string()));

  let folded_ok = Task::of(4).fold(|_e| "rejected".to_string(), |n| format!("got {n}"));
  assert_eq!(folded_ok.run().outcome().await, Ok("got 4".to_string()));
}

#[tokio::test]
async fn test_if_else_branches_on_value() {
  setup_tracing_for_test();
  let branch = |seed: i32| {
    Task::of(seed).if_else(
      |n| *n % 2 == 0,
      |n| Task::of(format!("even {n}")),
      |n| Task::of(format!("odd {n}")),
    )
  };

  assert_eq!(branch(4).run().outcome().await, Ok("even 4".to_string()));
  assert_eq!(branch(5).run().outcome().await, Ok("odd 5".to_string()));
}

#[tokio::test]
async fn test_finally_runs_on_both_outcomes() {
  setup_tracing_for_test();
  let ran = Arc::new(AtomicUsize::new(0));

  let ran_clone = ran.clone();
  let ok = Task::of(1).finally(move || {
    ran_clone.fetch_add(1, Ordering::SeqCst);
  });
  assert_eq!(ok.run().outcome().await, Ok(1));

  let ran_clone = ran.clone();
  let err = failing_task("x").finally(move || {
    ran_clone.fetch_add(1, Ordering::SeqCst);
  });
  assert!(err.run().outcome().await.is_err());

  assert_eq!(ran.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_zip_pairs_results() {
  setup_tracing_for_test();
  let left = Task::of(1).delay(Duration::from_millis(40));
  let right = Task::of("right".to_string());

  let zipped = left.zip(&right);
  assert_eq!(zipped.run().outcome().await, Ok((1, "right".to_string())));

  let summed = Task::of(2).zip_with(&Task::of(3), |a, b| a + b);
  assert_eq!(summed.run().outcome().await, Ok(5));
}

#[tokio::test]
async fn test_zip_rejects_on_first_failure() {
  setup_tracing_for_test();
  let slow_ok = Task::of(1).delay(Duration::from_millis(300));
  let fast_fail = failing_task("fast failure").delay(Duration::from_millis(20));

  let zipped = slow_ok.zip(&fast_fail);
  let started = Instant::now();
  assert_eq!(
    zipped.run().outcome().await,
    Err(TaskError::Execution("fast failure".to_string()))
  );
  assert!(
    started.elapsed() < Duration::from_millis(250),
    "zip must reject as soon as either side rejects"
  );
}

#[tokio::test]
async fn test_retry_succeeds_on_final_attempt() {
  setup_tracing_for_test();
  let attempts = Arc::new(AtomicUsize::new(0));
  let attempts_clone = attempts.clone();
  let source = Task::new(move |_cx| {
    let attempts = attempts_clone.clone();
    async move {
      let attempt = attempts.fetch_add(1, Ordering::SeqCst);
      if attempt < 2 {
        Err(TaskError::execution(format!("attempt {attempt} failed")))
      } else {
        Ok("third time lucky".to_string())
      }
    }
  });

  let retried = source.retry(3);
  assert_eq!(retried.run().outcome().await, Ok("third time lucky".to_string()));
  assert_eq!(attempts.load(Ordering::SeqCst), 3, "invoked exactly three times");
}

#[tokio::test]
async fn test_retry_rejects_with_last_error_after_final_attempt() {
  setup_tracing_for_test();
  let attempts = Arc::new(AtomicUsize::new(0));
  let attempts_clone = attempts.clone();
  let source: Task<i32> = Task::new(move |_cx| {
    let attempts = attempts_clone.clone();
    async move {
      let attempt = attempts.fetch_add(1, Ordering::SeqCst);
      Err(TaskError::execution(format!("attempt {attempt}")))
    }
  });

  let retried = source.retry(2);
  assert_eq!(
    retried.run().outcome().await,
    Err(TaskError::Execution("attempt 1".to_string()))
  );
  assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_backoff_spaces_attempts() {
  setup_tracing_for_test();
  let source: Task<i32> = Task::new(|_cx| async move { Err(TaskError::execution("always")) });

  let policy = RetryPolicy::attempts(3)
    .with_delay(Duration::from_millis(50))
    .with_backoff_factor(2.0);

  let started = Instant::now();
  assert!(source.retry_with(policy).run().outcome().await.is_err());
  // Waits of 50ms and 100ms separate the three attempts.
  assert!(
    started.elapsed() >= Duration::from_millis(140),
    "backoff delays must space out the attempts"
  );
}

#[tokio::test]
async fn test_retry_predicate_stops_early() {
  setup_tracing_for_test();
  let attempts = Arc::new(AtomicUsize::new(0));
  let attempts_clone = attempts.clone();
  let source: Task<i32> = Task::new(move |_cx| {
    let attempts = attempts_clone.clone();
    async move {
      attempts.fetch_add(1, Ordering::SeqCst);
      Err(TaskError::execution("fatal"))
    }
  });

  let policy = RetryPolicy::attempts(5).with_should_retry(|error, _attempt| {
    !matches!(error, TaskError::Execution(message) if message == "fatal")
  });

  assert!(source.retry_with(policy).run().outcome().await.is_err());
  assert_eq!(attempts.load(Ordering::SeqCst), 1, "predicate declined the retry");
}

#[tokio::test]
async fn test_delay_defers_execution() {
  setup_tracing_for_test();
  let started = Instant::now();
  let task = Task::of(9).delay(Duration::from_millis(100));
  assert_eq!(task.run().outcome().await, Ok(9));
  assert!(started.elapsed() >= Duration::from_millis(90));
}

#[tokio::test]
async fn test_timeout_cancels_slow_task() {
  setup_tracing_for_test();
  let completed = Arc::new(AtomicBool::new(false));
  let completed_clone = completed.clone();
  let slow = Task::new(move |_cx| {
    let completed = completed_clone.clone();
    async move {
      sleep(Duration::from_secs(5)).await;
      completed.store(true, Ordering::SeqCst);
      Ok(1)
    }
  });

  let limit = Duration::from_millis(100);
  assert_eq!(
    slow.timeout(limit).run().outcome().await,
    Err(TaskError::Timeout(limit))
  );

  sleep(Duration::from_millis(200)).await;
  assert!(
    !completed.load(Ordering::SeqCst),
    "losing side of the timeout race must be cancelled"
  );
}

#[tokio::test]
async fn test_timeout_passes_fast_task() {
  setup_tracing_for_test();
  let fast = Task::of(5).delay(Duration::from_millis(20));
  assert_eq!(
    fast.timeout(Duration::from_millis(500)).run().outcome().await,
    Ok(5)
  );
}

#[tokio::test]
async fn test_double_debounce_collapses_to_longest_window() {
  setup_tracing_for_test();
  let invocations = Arc::new(AtomicUsize::new(0));
  let invocations_clone = invocations.clone();
  let source = Task::new(move |_cx| {
    let invocations = invocations_clone.clone();
    async move {
      invocations.fetch_add(1, Ordering::SeqCst);
      Ok("fired".to_string())
    }
  });

  let debounced = source.debounce(Duration::from_millis(200)).debounce(Duration::from_millis(500));

  let started = Instant::now();
  assert_eq!(debounced.run().outcome().await, Ok("fired".to_string()));
  let elapsed = started.elapsed();

  assert!(
    elapsed >= Duration::from_millis(490),
    "must wait the full 500ms window, got {elapsed:?}"
  );
  assert!(
    elapsed < Duration::from_millis(680),
    "windows must collapse rather than add up to 700ms, got {elapsed:?}"
  );
  assert_eq!(invocations.load(Ordering::SeqCst), 1, "underlying executor runs once");
}

#[tokio::test]
async fn test_debounce_supersedes_pending_runs() {
  setup_tracing_for_test();
  let invocations = Arc::new(AtomicUsize::new(0));
  let invocations_clone = invocations.clone();
  let source = Task::new(move |_cx| {
    let invocations = invocations_clone.clone();
    async move {
      invocations.fetch_add(1, Ordering::SeqCst);
      Ok(1)
    }
  });

  let debounced = source.debounce(Duration::from_millis(100));

  let first = debounced.run();
  sleep(Duration::from_millis(30)).await;
  let second = debounced.run();

  assert_eq!(second.outcome().await, Ok(1));
  assert_eq!(invocations.load(Ordering::SeqCst), 1);
  assert!(
    timeout(Duration::from_millis(150), first.outcome()).await.is_err(),
    "superseded run must never settle"
  );
}

#[tokio::test]
async fn test_debounce_cancel_clears_pending_timer() {
  setup_tracing_for_test();
  let invocations = Arc::new(AtomicUsize::new(0));
  let invocations_clone = invocations.clone();
  let source = Task::new(move |_cx| {
    let invocations = invocations_clone.clone();
    async move {
      invocations.fetch_add(1, Ordering::SeqCst);
      Ok(1)
    }
  });

  let debounced = source.debounce(Duration::from_millis(100));
  let _pending = debounced.run();
  sleep(Duration::from_millis(20)).await;

  debounced.cancel();
  sleep(Duration::from_millis(200)).await;

  assert_eq!(
    invocations.load(Ordering::SeqCst),
    0,
    "cancelling must clear the timer without running the source"
  );
}

#[tokio::test]
async fn test_throttle_reuses_hot_window() {
  setup_tracing_for_test();
  let invocations = Arc::new(AtomicUsize::new(0));
  let invocations_clone = invocations.clone();
  let source = Task::new(move |_cx| {
    let invocations = invocations_clone.clone();
    async move { Ok(invocations.fetch_add(1, Ordering::SeqCst) + 1) }
  });

  let throttled = source.throttle(Duration::from_millis(200));

  let first = throttled.run();
  let second = throttled.run();
  assert_eq!(first.id(), second.id(), "hot window returns the cached execution");
  assert_eq!(first.outcome().await, Ok(1));
  assert_eq!(second.outcome().await, Ok(1));
  assert_eq!(invocations.load(Ordering::SeqCst), 1);

  sleep(Duration::from_millis(250)).await;
  let third = throttled.run();
  assert_eq!(third.outcome().await, Ok(2));
  assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_throttle_caches_errors_too() {
  setup_tracing_for_test();
  let invocations = Arc::new(AtomicUsize::new(0));
  let invocations_clone = invocations.clone();
  let source: Task<i32> = Task::new(move |_cx| {
    let invocations = invocations_clone.clone();
    async move {
      invocations.fetch_add(1, Ordering::SeqCst);
      Err(TaskError::execution("cached failure"))
    }
  });

  let throttled = source.throttle(Duration::from_millis(300));
  let expected = Err(TaskError::Execution("cached failure".to_string()));

  assert_eq!(throttled.run().outcome().await, expected);
  assert_eq!(throttled.run().outcome().await, expected);
  assert_eq!(invocations.load(Ordering::SeqCst), 1);
}
