//! Background execution of submitted tasks.
//!
//! [`TaskExecutor::submit`] registers a task, hands its work to a tokio task
//! and returns the token without waiting. Each task gets its own tokio task;
//! the only bound on concurrency is the optional semaphore configured with
//! [`TaskExecutor::with_concurrency_limit`].
//!
//! # Execution Flow
//!
//! 1. `submit` calls [`TaskRegistry::create`](crate::scheduler::TaskRegistry::create)
//! 2. The background task acquires a permit and marks the task `Running`
//! 3. The work future runs on its own spawned task, so a panic surfaces as a
//!    `JoinError` instead of tearing down the supervisor
//! 4. The outcome becomes a single `Complete` or `Fail` write
//!
//! There is no cancellation: once submitted, a task runs until it finishes,
//! fails, or hits the configured deadline.

pub mod executor;

pub use executor::TaskExecutor;
