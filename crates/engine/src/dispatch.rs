//! Execution boundary between the scheduler and the workers.

use async_trait::async_trait;

use crate::models::{ExecutableTask, RunId, TaskId};
use crate::EngineError;

/// Hands tasks to whatever executes them.
///
/// `dispatch` only has to accept the task; the outcome arrives later as a
/// `TaskExecutionResult` written to the run store under
/// `(run_id, task_id)`. Exactly one result per attempt is expected, and
/// extra deliveries are ignored by the store.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: ExecutableTask, attempt: u32) -> Result<(), EngineError>;

    /// Best-effort signal that an in-flight task's run was cancelled.
    async fn cancel(&self, _run_id: &RunId, _task_id: &TaskId) {}
}
