//! `MockExecutor` — a test double for `TaskExecutor`.
//!
//! Useful in unit and integration tests where a real executor is either
//! unavailable or irrelevant.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use engine::{ExecutableTask, TaskExecutionResult, TaskExecutionStatus, TaskId};
use tracing::debug;

use crate::{ExecutionContext, TaskExecutor, WorkerError};

/// Behaviour injected into `MockExecutor` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Succeed; the result value is the task's parameters as JSON.
    EchoParameters,
    /// Report the given status with a message.
    Report(TaskExecutionStatus, String),
    /// Fail with a `Retryable` error this many times, then echo.
    FlakyThen(usize),
    /// Fail with a `Retryable` error every time.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

/// A mock executor that records every task it runs and returns a
/// programmer-specified result.
#[derive(Clone)]
pub struct MockExecutor {
    pub behaviour: MockBehaviour,
    /// Simulated work time before answering.
    pub latency: Duration,
    /// `(task_id, attempt, try_number)` of every call, in call order.
    pub calls: Arc<Mutex<Vec<(TaskId, u32, u32)>>>,
}

impl MockExecutor {
    fn with(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            latency: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn echoing() -> Self {
        Self::with(MockBehaviour::EchoParameters)
    }

    pub fn reporting(status: TaskExecutionStatus, message: impl Into<String>) -> Self {
        Self::with(MockBehaviour::Report(status, message.into()))
    }

    pub fn flaky(failures: usize) -> Self {
        Self::with(MockBehaviour::FlakyThen(failures))
    }

    pub fn failing_retryable(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailFatal(msg.into()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of times this executor has been called.
    pub fn call_count(&self) -> usize {
        self.recorded().len()
    }

    /// Calls made for one task.
    pub fn calls_for(&self, task_id: &TaskId) -> Vec<(u32, u32)> {
        self.recorded()
            .iter()
            .filter(|(id, _, _)| id == task_id)
            .map(|(_, attempt, try_number)| (*attempt, *try_number))
            .collect()
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Vec<(TaskId, u32, u32)>> {
        // A panicking test thread must not hide the calls from the others.
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn echo(task: &ExecutableTask) -> Result<TaskExecutionResult, WorkerError> {
        let value = serde_json::to_string(&task.parameters).map_err(|e| WorkerError::Fatal(e.to_string()))?;
        Ok(TaskExecutionResult::success(value))
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute(
        &self,
        task: &ExecutableTask,
        ctx: &ExecutionContext,
    ) -> Result<TaskExecutionResult, WorkerError> {
        let call_index = {
            let mut calls = self.recorded();
            calls.push((task.task_id.clone(), ctx.attempt, ctx.try_number));
            calls.len()
        };
        debug!(task_id = %task.task_id, attempt = ctx.attempt, try_number = ctx.try_number, "mock executor called");

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match &self.behaviour {
            MockBehaviour::EchoParameters => Self::echo(task),
            MockBehaviour::Report(status, message) => {
                Ok(TaskExecutionResult::new(*status, message.clone(), Default::default()))
            }
            MockBehaviour::FlakyThen(failures) if call_index <= *failures => {
                Err(WorkerError::Retryable(format!("transient failure {call_index}")))
            }
            MockBehaviour::FlakyThen(_) => Self::echo(task),
            MockBehaviour::FailRetryable(msg) => Err(WorkerError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(WorkerError::Fatal(msg.clone())),
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn task(id: &str) -> ExecutableTask {
        let mut parameters = HashMap::new();
        parameters.insert("region".to_string(), "eu".to_string());
        ExecutableTask {
            run_id: "run".into(),
            task_id: id.into(),
            task_type: None,
            parameters,
            is_executable: true,
        }
    }

    fn ctx(try_number: u32) -> ExecutionContext {
        ExecutionContext {
            attempt: 1,
            try_number,
            worker: 0,
        }
    }

    #[tokio::test]
    async fn echo_returns_parameters_as_json() {
        let mock = MockExecutor::echoing();
        let result = mock.execute(&task("t"), &ctx(1)).await.unwrap();
        assert_eq!(result.status, TaskExecutionStatus::Success);
        assert_eq!(result.result_value, r#"{"region":"eu"}"#);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn flaky_mock_recovers_after_configured_failures() {
        let mock = MockExecutor::flaky(2);
        assert!(matches!(mock.execute(&task("t"), &ctx(1)).await, Err(WorkerError::Retryable(_))));
        assert!(matches!(mock.execute(&task("t"), &ctx(2)).await, Err(WorkerError::Retryable(_))));
        assert!(mock.execute(&task("t"), &ctx(3)).await.is_ok());
        assert_eq!(mock.calls_for(&"t".into()), vec![(1, 1), (1, 2), (1, 3)]);
    }

    #[tokio::test]
    async fn reporting_mock_returns_its_status() {
        let mock = MockExecutor::reporting(TaskExecutionStatus::FailedStop, "halt");
        let result = mock.execute(&task("t"), &ctx(1)).await.unwrap();
        assert_eq!(result.status, TaskExecutionStatus::FailedStop);
        assert_eq!(result.result_value, "halt");
    }
}
