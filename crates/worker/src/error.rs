//! Worker-level error type.

use thiserror::Error;

/// Errors returned by [`TaskExecutor::execute`](crate::TaskExecutor::execute).
///
/// The pool uses the variant to decide retry behaviour:
/// - `Retryable` — the attempt is retried in place with exponential back-off.
/// - `Fatal`     — the task is reported as failed immediately.
///
/// A task that wants to report a failure status of its own (for example
/// stopping the whole run) returns `Ok` with that status instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Transient failure; the pool should try again.
    #[error("retryable worker error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal worker error: {0}")]
    Fatal(String),
}
