//! Built-in executors.
//!
//! - [`EchoExecutor`] succeeds immediately, reporting the task's parameters.
//! - [`ShellExecutor`] runs the task's `command` parameter through `sh -c`.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use engine::{ExecutableTask, TaskExecutionResult, TaskExecutionStatus};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{ExecutionContext, TaskExecutor, WorkerError};

/// Parameter holding the shell command line.
pub const COMMAND_PARAMETER: &str = "command";

// ---------------------------------------------------------------------------
// EchoExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(
        &self,
        task: &ExecutableTask,
        ctx: &ExecutionContext,
    ) -> Result<TaskExecutionResult, WorkerError> {
        info!(task_id = %task.task_id, attempt = ctx.attempt, "echo");
        let value = serde_json::to_string(&task.parameters).map_err(|e| WorkerError::Fatal(e.to_string()))?;
        Ok(TaskExecutionResult::success(value))
    }
}

// ---------------------------------------------------------------------------
// ShellExecutor
// ---------------------------------------------------------------------------

/// Runs `sh -c <command>` with the remaining parameters as environment
/// variables (upper-cased, prefixed `TASK_`).
///
/// Exit status 0 is success with stdout as the result value. A non-zero
/// exit is a `FAILED_CONTINUE` result carrying stderr and the exit code.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self { shell: "sh".into() }
    }
}

impl ShellExecutor {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }
}

fn env_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("TASK_{sanitized}")
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(
        &self,
        task: &ExecutableTask,
        ctx: &ExecutionContext,
    ) -> Result<TaskExecutionResult, WorkerError> {
        let command = task
            .parameters
            .get(COMMAND_PARAMETER)
            .ok_or_else(|| WorkerError::Fatal(format!("missing '{COMMAND_PARAMETER}' parameter")))?;

        debug!(task_id = %task.task_id, attempt = ctx.attempt, %command, "running shell command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .envs(
                task.parameters
                    .iter()
                    .filter(|(k, _)| k.as_str() != COMMAND_PARAMETER)
                    .map(|(k, v)| (env_name(k), v)),
            )
            .env("TASK_ID", task.task_id.as_str())
            .env("RUN_ID", task.run_id.as_str())
            .stdin(Stdio::null())
            .output()
            .await
            // Spawn failures (missing shell, fd exhaustion) are usually transient.
            .map_err(|e| WorkerError::Retryable(format!("failed to spawn '{}': {e}", self.shell)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            return Ok(TaskExecutionResult::success(stdout));
        }

        let mut data = HashMap::new();
        data.insert("stdout".to_string(), stdout);
        if let Some(code) = output.status.code() {
            data.insert("exitCode".to_string(), code.to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        Ok(TaskExecutionResult::new(
            TaskExecutionStatus::FailedContinue,
            stderr,
            data,
        ))
    }
}
