//! Queue-level error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The pool has been shut down and accepts no more work.
    #[error("worker pool is shut down")]
    Closed,

    /// No executor is registered for the task's type.
    #[error("no executor registered for task type '{0}'")]
    NoExecutor(String),

    /// Grouping nodes carry no type and are never dispatched.
    #[error("task '{0}' is not executable")]
    NotExecutable(String),

    /// A worker task panicked or was aborted.
    #[error("worker {worker} stopped abnormally: {message}")]
    WorkerStopped { worker: usize, message: String },
}
