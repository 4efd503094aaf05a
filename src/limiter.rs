use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::error::TaskError;
use crate::execution::Execution;
use crate::scope::Scope;
use crate::task::Task;

lazy_static::lazy_static! {
  static ref NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);
}

type Hook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&TaskError) + Send + Sync>;

/// Optional observer callbacks for a [`Limiter`].
///
/// Every hook is panic-isolated: a panicking handler is logged and does not
/// disturb scheduling.
#[derive(Clone, Default)]
pub struct LimiterEvents {
  on_active: Option<Hook>,
  on_completed: Option<Hook>,
  on_error: Option<ErrorHook>,
  on_idle: Option<Hook>,
}

impl LimiterEvents {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fires when a job is dispatched into an execution slot.
  pub fn on_active(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_active = Some(Arc::new(hook));
    self
  }

  /// Fires when a dispatched job settles successfully.
  pub fn on_completed(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_completed = Some(Arc::new(hook));
    self
  }

  /// Fires when a dispatched job settles with an error.
  pub fn on_error(mut self, hook: impl Fn(&TaskError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(hook));
    self
  }

  /// Fires exactly once per transition into the idle state (no active jobs,
  /// empty queue).
  pub fn on_idle(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_idle = Some(Arc::new(hook));
    self
  }
}

type QueuedJob = Box<dyn FnOnce() + Send + Sync>;

struct LimiterState {
  active: usize,
  queue: VecDeque<u64>,
  idle: bool,
}

enum JobOutcome {
  Completed,
  Failed(TaskError),
  Cancelled,
}

enum DispatchStep {
  Run(u64),
  Idle,
  Done,
}

/// An admission controller bounding how many wrapped executions run at once,
/// across any number of tasks.
///
/// Jobs beyond the concurrency limit wait in a FIFO queue. Cancelling a
/// queued wrapped execution removes its job: it never dispatches and never
/// counts against the active limit. Counters and queue mutate only inside
/// the limiter's single critical section.
#[derive(Clone)]
pub struct Limiter {
  inner: Arc<LimiterInner>,
}

struct LimiterInner {
  concurrency: usize,
  state: Mutex<LimiterState>,
  jobs: DashMap<u64, QueuedJob>,
  events: LimiterEvents,
}

impl Limiter {
  pub fn new(concurrency: usize) -> Self {
    Self::with_events(concurrency, LimiterEvents::default())
  }

  pub fn with_events(concurrency: usize, events: LimiterEvents) -> Self {
    Limiter {
      inner: Arc::new(LimiterInner {
        concurrency: concurrency.max(1),
        state: Mutex::new(LimiterState {
          active: 0,
          queue: VecDeque::new(),
          idle: true,
        }),
        jobs: DashMap::new(),
        events,
      }),
    }
  }

  pub fn concurrency(&self) -> usize {
    self.inner.concurrency
  }

  /// Jobs currently occupying an execution slot.
  pub fn active_count(&self) -> usize {
    self.inner.state.lock().active
  }

  /// Jobs waiting for a slot. Cancelled-but-not-yet-skipped queue entries
  /// are not counted.
  pub fn queued_count(&self) -> usize {
    let state = self.inner.state.lock();
    state
      .queue
      .iter()
      .filter(|job_id| self.inner.jobs.contains_key(*job_id))
      .count()
  }

  /// Wraps `task` so that running it goes through this limiter's admission
  /// control. The wrapped execution is `Idle` while queued and settles with
  /// the source's outcome once dispatched.
  pub fn wrap<T: Clone + Send + Sync + 'static>(&self, task: &Task<T>) -> Task<T> {
    let limiter = self.inner.clone();
    let source = task.clone();
    Task::from_intercept(Arc::new(move |root, override_scope| {
      let scope = Scope::derived(root, override_scope);
      if scope.is_aborted() {
        return Execution::idle(scope);
      }

      let execution = Execution::idle(scope.clone());
      let job_id = NEXT_JOB_ID.fetch_add(1, AtomicOrdering::Relaxed);

      let job: QueuedJob = {
        let limiter = limiter.clone();
        let source = source.clone();
        let scope = scope.clone();
        let execution = execution.clone();
        Box::new(move || {
          LimiterInner::fire(&limiter.events.on_active);
          execution.mark_running();
          let inner_execution = source.run_in(&scope);
          tokio::spawn(async move {
            tokio::select! {
              biased;
              _ = scope.cancelled() => {
                trace!(job_id, "limited execution aborted in flight; releasing slot");
                limiter.finish_job(JobOutcome::Cancelled);
              }
              outcome = inner_execution.outcome() => {
                match outcome {
                  Ok(value) => {
                    execution.settle_ok(value);
                    limiter.finish_job(JobOutcome::Completed);
                  }
                  Err(job_error) => {
                    execution.settle_err(job_error.clone());
                    limiter.finish_job(JobOutcome::Failed(job_error));
                  }
                }
              }
            }
          });
        })
      };

      limiter.jobs.insert(job_id, job);
      {
        let limiter = limiter.clone();
        scope.on_abort(move || {
          if limiter.jobs.remove(&job_id).is_some() {
            trace!(job_id, "queued job removed after cancellation");
          }
        });
      }
      limiter.admit(job_id);
      execution
    }))
  }
}

impl LimiterInner {
  /// Dispatch immediately if a slot is free, otherwise enqueue FIFO.
  fn admit(&self, job_id: u64) {
    let dispatch_now = {
      let mut state = self.state.lock();
      state.idle = false;
      if state.active < self.concurrency {
        state.active += 1;
        true
      } else {
        state.queue.push_back(job_id);
        trace!(job_id, queued = state.queue.len(), "limiter at capacity; job queued");
        false
      }
    };
    if dispatch_now {
      self.run_claimed(job_id);
    }
  }

  /// Runs a job whose slot is already claimed. A job cancelled between
  /// claiming and dispatch gives its slot back.
  fn run_claimed(&self, job_id: u64) {
    if let Some((_, job)) = self.jobs.remove(&job_id) {
      trace!(job_id, "dispatching job");
      job();
    } else {
      trace!(job_id, "job vanished before dispatch; releasing slot");
      {
        let mut state = self.state.lock();
        state.active -= 1;
      }
      self.dispatch_next();
    }
  }

  /// Settlement path: release the slot, fire completion hooks, pump the
  /// queue.
  fn finish_job(&self, outcome: JobOutcome) {
    {
      let mut state = self.state.lock();
      state.active -= 1;
    }
    match &outcome {
      JobOutcome::Completed => Self::fire(&self.events.on_completed),
      JobOutcome::Failed(job_error) => {
        if let Some(hook) = &self.events.on_error {
          Self::fire_error(hook, job_error);
        }
      }
      JobOutcome::Cancelled => {}
    }
    self.dispatch_next();
  }

  fn dispatch_next(&self) {
    loop {
      let step = {
        let mut state = self.state.lock();
        if state.active >= self.concurrency {
          DispatchStep::Done
        } else {
          let mut claimed = None;
          while let Some(job_id) = state.queue.pop_front() {
            if self.jobs.contains_key(&job_id) {
              claimed = Some(job_id);
              break;
            }
            trace!(job_id, "dropping cancelled job from queue");
          }
          match claimed {
            Some(job_id) => {
              state.active += 1;
              DispatchStep::Run(job_id)
            }
            None => {
              if state.active == 0 && state.queue.is_empty() && !state.idle {
                state.idle = true;
                DispatchStep::Idle
              } else {
                DispatchStep::Done
              }
            }
          }
        }
      };

      match step {
        DispatchStep::Run(job_id) => {
          if let Some((_, job)) = self.jobs.remove(&job_id) {
            trace!(job_id, "dispatching queued job");
            job();
          } else {
            // Raced with a cancellation after being claimed.
            let mut state = self.state.lock();
            state.active -= 1;
          }
        }
        DispatchStep::Idle => {
          debug!("limiter idle");
          Self::fire(&self.events.on_idle);
          return;
        }
        DispatchStep::Done => return,
      }
    }
  }

  fn fire(hook: &Option<Hook>) {
    if let Some(hook) = hook {
      let hook = hook.clone();
      if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
        error!("limiter event handler panicked");
      }
    }
  }

  fn fire_error(hook: &ErrorHook, job_error: &TaskError) {
    if catch_unwind(AssertUnwindSafe(|| hook(job_error))).is_err() {
      error!("limiter error handler panicked");
    }
  }
}
