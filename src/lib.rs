//! Lazy, cancellable, composable asynchronous tasks for Tokio, with
//! retry/backoff, debounce/throttle rate shaping, memoization and
//! bounded-concurrency execution.
//!
//! A [`Task`] is an immutable, reusable definition of a computation; nothing
//! runs until [`Task::run`] produces an [`Execution`]. Cancellation flows
//! through a tree of [`Scope`]s: cancelling a task aborts every execution
//! derived from it, while a caller-supplied override scope cancels just one.
//! Cancellation is cooperative and silent — a cancelled execution never
//! settles.

mod combinators;
mod context;
mod error;
mod execution;
mod group;
mod limiter;
mod scope;
mod task;
mod timing;

pub use context::TaskContext;
pub use error::{TaskError, TaskResult};
pub use execution::{Execution, ExecutionState};
pub use group::{
  all, all_settled, any, compose, filter, parallel, race, reduce, sequence, times, traverse,
  until, whilst,
};
pub use limiter::{Limiter, LimiterEvents};
pub use scope::Scope;
pub use task::{ExecutorFuture, Task};
pub use timing::RetryPolicy;
