//! Group orchestration: run many tasks serially or with a concurrency cap,
//! aggregating ordered results and short-circuiting on first failure.
//!
//! Every function that yields a `Vec` indexes results by original input
//! position, never by completion order. `sequence`, `reduce`, `traverse`,
//! `whilst`, `until` and `times` are strictly serial; `parallel`, `all`,
//! `all_settled`, `race`, `any` and `filter` admit work FIFO with
//! unconstrained completion order.

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::error::{TaskError, TaskResult};
use crate::execution::Execution;
use crate::task::Task;

fn indexed_outcome<T: Clone + Send + Sync + 'static>(
  index: usize,
  execution: Execution<T>,
) -> impl Future<Output = (usize, TaskResult<T>)> {
  async move { (index, execution.outcome().await) }
}

/// Runs `tasks` one at a time in order. Rejects on the first failure,
/// leaving the remaining tasks un-run; fulfils with every result otherwise.
pub fn sequence<T: Clone + Send + Sync + 'static>(tasks: Vec<Task<T>>) -> Task<Vec<T>> {
  Task::new(move |cx| {
    let tasks = tasks.clone();
    async move {
      let mut results = Vec::with_capacity(tasks.len());
      for (index, task) in tasks.iter().enumerate() {
        match task.run_in(cx.scope()).outcome().await {
          Ok(value) => results.push(value),
          Err(error) => {
            debug!(index, "sequence rejected; later tasks are never run");
            return Err(error);
          }
        }
      }
      Ok(results)
    }
  })
}

/// Runs `tasks` with at most `limit` in flight, admitting in input order.
///
/// Results land in their original index slots regardless of completion
/// order. The first failure cancels every in-flight sibling and rejects;
/// completions arriving after that are discarded.
pub fn parallel<T: Clone + Send + Sync + 'static>(tasks: Vec<Task<T>>, limit: usize) -> Task<Vec<T>> {
  Task::new(move |cx| {
    let tasks = tasks.clone();
    async move {
      let limit = limit.max(1);
      let total = tasks.len();
      let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
      let mut launched: Vec<Execution<T>> = Vec::with_capacity(total);
      let mut in_flight = FuturesUnordered::new();
      let mut cursor = 0;

      while cursor < total && cursor < limit {
        let execution = tasks[cursor].run_in(cx.scope());
        launched.push(execution.clone());
        in_flight.push(indexed_outcome(cursor, execution));
        cursor += 1;
      }

      while let Some((index, outcome)) = in_flight.next().await {
        match outcome {
          Ok(value) => {
            results[index] = Some(value);
            if cursor < total {
              let execution = tasks[cursor].run_in(cx.scope());
              launched.push(execution.clone());
              in_flight.push(indexed_outcome(cursor, execution));
              cursor += 1;
            }
          }
          Err(error) => {
            debug!(
              index,
              launched = launched.len(),
              "parallel member rejected; cancelling in-flight siblings"
            );
            for execution in &launched {
              execution.cancel();
            }
            return Err(error);
          }
        }
      }

      let mut ordered = Vec::with_capacity(total);
      for slot in results {
        ordered.push(slot.expect("every parallel slot is written exactly once"));
      }
      Ok(ordered)
    }
  })
}

/// [`parallel`] without a concurrency cap.
pub fn all<T: Clone + Send + Sync + 'static>(tasks: Vec<Task<T>>) -> Task<Vec<T>> {
  let limit = tasks.len().max(1);
  parallel(tasks, limit)
}

/// Runs every task to settlement and never rejects: each slot carries that
/// task's own outcome, in input order.
pub fn all_settled<T: Clone + Send + Sync + 'static>(
  tasks: Vec<Task<T>>,
) -> Task<Vec<TaskResult<T>>> {
  Task::new(move |cx| {
    let tasks = tasks.clone();
    async move {
      let total = tasks.len();
      let mut in_flight = FuturesUnordered::new();
      for (index, task) in tasks.iter().enumerate() {
        in_flight.push(indexed_outcome(index, task.run_in(cx.scope())));
      }
      let mut results: Vec<Option<TaskResult<T>>> = (0..total).map(|_| None).collect();
      while let Some((index, outcome)) = in_flight.next().await {
        results[index] = Some(outcome);
      }
      let mut ordered = Vec::with_capacity(total);
      for slot in results {
        ordered.push(slot.expect("every settled slot is written exactly once"));
      }
      Ok(ordered)
    }
  })
}

/// Settles with the first task to settle, success or failure. The losers are
/// cancelled. A race over no tasks never settles.
pub fn race<T: Clone + Send + Sync + 'static>(tasks: Vec<Task<T>>) -> Task<T> {
  Task::new(move |cx| {
    let tasks = tasks.clone();
    async move {
      if tasks.is_empty() {
        return futures::future::pending::<TaskResult<T>>().await;
      }
      let mut launched = Vec::with_capacity(tasks.len());
      let mut in_flight = FuturesUnordered::new();
      for (index, task) in tasks.iter().enumerate() {
        let execution = task.run_in(cx.scope());
        launched.push(execution.clone());
        in_flight.push(indexed_outcome(index, execution));
      }
      let (winner, outcome) = in_flight
        .next()
        .await
        .expect("a non-empty race yields a first settlement");
      debug!(winner, "race settled; cancelling losers");
      for (index, execution) in launched.iter().enumerate() {
        if index != winner {
          execution.cancel();
        }
      }
      outcome
    }
  })
}

/// Fulfils with the first task to fulfil, cancelling the rest. If every task
/// rejects, rejects with [`TaskError::Aggregate`] carrying the errors in
/// input order.
pub fn any<T: Clone + Send + Sync + 'static>(tasks: Vec<Task<T>>) -> Task<T> {
  Task::new(move |cx| {
    let tasks = tasks.clone();
    async move {
      if tasks.is_empty() {
        return Err(TaskError::Aggregate(Vec::new()));
      }
      let mut launched = Vec::with_capacity(tasks.len());
      let mut in_flight = FuturesUnordered::new();
      for (index, task) in tasks.iter().enumerate() {
        let execution = task.run_in(cx.scope());
        launched.push(execution.clone());
        in_flight.push(indexed_outcome(index, execution));
      }
      let mut errors: Vec<Option<TaskError>> = (0..tasks.len()).map(|_| None).collect();
      while let Some((index, outcome)) = in_flight.next().await {
        match outcome {
          Ok(value) => {
            debug!(winner = index, "any fulfilled; cancelling remaining alternatives");
            for (i, execution) in launched.iter().enumerate() {
              if i != index {
                execution.cancel();
              }
            }
            return Ok(value);
          }
          Err(error) => {
            errors[index] = Some(error);
          }
        }
      }
      let ordered = errors
        .into_iter()
        .map(|slot| slot.expect("every rejected alternative records its error"))
        .collect();
      Err(TaskError::Aggregate(ordered))
    }
  })
}

/// Serial left fold over the tasks' results.
pub fn reduce<T, A>(
  tasks: Vec<Task<T>>,
  init: A,
  fold: impl Fn(A, T) -> A + Send + Sync + 'static,
) -> Task<A>
where
  T: Clone + Send + Sync + 'static,
  A: Clone + Send + Sync + 'static,
{
  let fold = Arc::new(fold);
  Task::new(move |cx| {
    let tasks = tasks.clone();
    let fold = fold.clone();
    let mut accumulator = init.clone();
    async move {
      for task in &tasks {
        let value = task.run_in(cx.scope()).outcome().await?;
        accumulator = fold(accumulator, value);
      }
      Ok(accumulator)
    }
  })
}

/// Maps each item to a task and runs them one at a time, in order.
pub fn traverse<A, T>(
  items: Vec<A>,
  to_task: impl Fn(A) -> Task<T> + Send + Sync + 'static,
) -> Task<Vec<T>>
where
  A: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  let to_task = Arc::new(to_task);
  Task::new(move |cx| {
    let items = items.clone();
    let to_task = to_task.clone();
    async move {
      let mut results = Vec::with_capacity(items.len());
      for item in items {
        results.push(to_task(item).run_in(cx.scope()).outcome().await?);
      }
      Ok(results)
    }
  })
}

/// Runs `to_task(0..count)` one at a time, collecting the results.
pub fn times<T: Clone + Send + Sync + 'static>(
  count: usize,
  to_task: impl Fn(usize) -> Task<T> + Send + Sync + 'static,
) -> Task<Vec<T>> {
  let to_task = Arc::new(to_task);
  Task::new(move |cx| {
    let to_task = to_task.clone();
    async move {
      let mut results = Vec::with_capacity(count);
      for index in 0..count {
        results.push(to_task(index).run_in(cx.scope()).outcome().await?);
      }
      Ok(results)
    }
  })
}

/// Repeatedly runs `body` while `test()` holds, testing before each run.
pub fn whilst<T: Clone + Send + Sync + 'static>(
  test: impl Fn() -> bool + Send + Sync + 'static,
  body: impl Fn() -> Task<T> + Send + Sync + 'static,
) -> Task<Vec<T>> {
  let test = Arc::new(test);
  let body = Arc::new(body);
  Task::new(move |cx| {
    let test = test.clone();
    let body = body.clone();
    async move {
      let mut results = Vec::new();
      while test() {
        results.push(body().run_in(cx.scope()).outcome().await?);
      }
      Ok(results)
    }
  })
}

/// Runs `body` and then consults `test()`, repeating until it returns true.
/// Always runs at least once.
pub fn until<T: Clone + Send + Sync + 'static>(
  test: impl Fn() -> bool + Send + Sync + 'static,
  body: impl Fn() -> Task<T> + Send + Sync + 'static,
) -> Task<Vec<T>> {
  let test = Arc::new(test);
  let body = Arc::new(body);
  Task::new(move |cx| {
    let test = test.clone();
    let body = body.clone();
    async move {
      let mut results = Vec::new();
      loop {
        results.push(body().run_in(cx.scope()).outcome().await?);
        if test() {
          return Ok(results);
        }
      }
    }
  })
}

/// Keeps the items whose predicate task fulfils with `true`. Predicates run
/// concurrently; the kept items stay in input order.
pub fn filter<A>(
  items: Vec<A>,
  predicate: impl Fn(&A) -> Task<bool> + Send + Sync + 'static,
) -> Task<Vec<A>>
where
  A: Clone + Send + Sync + 'static,
{
  let predicate = Arc::new(predicate);
  Task::new(move |cx| {
    let items = items.clone();
    let predicate = predicate.clone();
    async move {
      let mut in_flight = FuturesUnordered::new();
      for (index, item) in items.iter().enumerate() {
        in_flight.push(indexed_outcome(index, predicate(item).run_in(cx.scope())));
      }
      let mut keep = vec![false; items.len()];
      while let Some((index, outcome)) = in_flight.next().await {
        keep[index] = outcome?;
      }
      Ok(
        items
          .into_iter()
          .zip(keep)
          .filter_map(|(item, kept)| kept.then_some(item))
          .collect(),
      )
    }
  })
}

/// Kleisli composition, left to right: `compose(f, g)(a)` runs `f(a)` and
/// feeds the result to `g`.
pub fn compose<A, B, C>(
  first: impl Fn(A) -> Task<B> + Send + Sync + 'static,
  second: impl Fn(B) -> Task<C> + Send + Sync + 'static,
) -> impl Fn(A) -> Task<C>
where
  A: Clone + Send + Sync + 'static,
  B: Clone + Send + Sync + 'static,
  C: Clone + Send + Sync + 'static,
{
  let first = Arc::new(first);
  let second = Arc::new(second);
  move |input: A| {
    let second = second.clone();
    first(input).flat_map(move |value| second(value))
  }
}
