//! Records exchanged with workers: dispatch markers and execution results.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StartedTask
// ---------------------------------------------------------------------------

/// Written immediately before a task is handed to a worker.
///
/// Its presence without a matching result means the task was in flight; this
/// is what recovery inspects after a scheduler restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedTask {
    /// Dispatch payload: which scheduler instance sent which attempt.
    pub data: String,
    /// 1-based attempt counter.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub start_time_utc: DateTime<Utc>,
}

fn first_attempt() -> u32 {
    1
}

impl StartedTask {
    pub fn new(instance_id: &str, attempt: u32, start_time_utc: DateTime<Utc>) -> Self {
        Self {
            data: format!("{instance_id}#{attempt}"),
            attempt,
            start_time_utc,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskExecutionStatus
// ---------------------------------------------------------------------------

/// Final status reported for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    Success,
    /// The task failed; its dependents become unreachable, the rest of the
    /// run carries on.
    FailedContinue,
    /// The task failed and the whole run must stop.
    FailedStop,
    /// The task was terminated because its run was cancelled.
    Cancelled,
}

impl TaskExecutionStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

// ---------------------------------------------------------------------------
// TaskExecutionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionResult {
    pub status: TaskExecutionStatus,
    #[serde(default)]
    pub result_value: String,
    #[serde(default)]
    pub result_data: HashMap<String, String>,
}

impl TaskExecutionResult {
    pub fn new(
        status: TaskExecutionStatus,
        result_value: impl Into<String>,
        result_data: HashMap<String, String>,
    ) -> Self {
        Self {
            status,
            result_value: result_value.into(),
            result_data,
        }
    }

    pub fn success(result_value: impl Into<String>) -> Self {
        Self::new(TaskExecutionStatus::Success, result_value, HashMap::new())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(TaskExecutionStatus::FailedContinue, message, HashMap::new())
    }

    pub fn cancelled() -> Self {
        Self::new(TaskExecutionStatus::Cancelled, "", HashMap::new())
    }
}
