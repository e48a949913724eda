//! The `TaskExecutor` trait — the contract every worker implementation fulfils.

use async_trait::async_trait;
use engine::{ExecutableTask, TaskExecutionResult};

use crate::WorkerError;

/// Per-attempt information passed alongside the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Dispatch attempt, as recorded in the task's `StartedTask`.
    pub attempt: u32,
    /// In-place retry within this attempt, starting at 1.
    pub try_number: u32,
    /// Index of the pool worker running the task.
    pub worker: usize,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` with its merged parameters and report the outcome.
    async fn execute(
        &self,
        task: &ExecutableTask,
        ctx: &ExecutionContext,
    ) -> Result<TaskExecutionResult, WorkerError>;
}
