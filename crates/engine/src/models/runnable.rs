//! Per-run, execution-ready records produced by materialization.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{RunId, TaskId, TaskType};

/// Parameter key through which a delay-capable task declares its delay.
pub const DELAY_MS_PARAMETER: &str = "delay_ms";

// ---------------------------------------------------------------------------
// ExecutableTask
// ---------------------------------------------------------------------------

/// The unit handed to a worker.
///
/// `parameters` are the task's metadata merged with the run's overrides.
/// Grouping nodes are materialized too, with `is_executable == false` and no
/// type, so they can act as join points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutableTask {
    pub run_id: RunId,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub is_executable: bool,
}

impl ExecutableTask {
    /// Whether re-running this task after a crash is safe.
    pub fn is_idempotent(&self) -> bool {
        self.task_type.as_ref().is_some_and(TaskType::is_idempotent)
    }

    /// Declared pre-execution delay, honoured only for types with `has_delay`.
    pub fn delay(&self) -> Option<Duration> {
        if !self.task_type.as_ref().is_some_and(TaskType::has_delay) {
            return None;
        }
        self.parameters
            .get(DELAY_MS_PARAMETER)
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// RunnableTaskDag
// ---------------------------------------------------------------------------

/// Structural skeleton entry: a task and the ids of its direct dependents
/// (the children that may only start once it has completed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableTaskDag {
    pub task_id: TaskId,
    #[serde(default)]
    pub dependent_task_ids: BTreeSet<TaskId>,
}

impl RunnableTaskDag {
    pub fn new(task_id: TaskId, dependents: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            task_id,
            dependent_task_ids: dependents.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunnableTask
// ---------------------------------------------------------------------------

/// Full persisted snapshot of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableTask {
    pub tasks: HashMap<TaskId, ExecutableTask>,
    pub task_dags: Vec<RunnableTaskDag>,
    pub start_time_utc: DateTime<Utc>,
    #[serde(default)]
    completion_time_utc: Option<DateTime<Utc>>,
}

impl RunnableTask {
    pub fn new(
        tasks: HashMap<TaskId, ExecutableTask>,
        task_dags: Vec<RunnableTaskDag>,
        start_time_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            tasks,
            task_dags,
            start_time_utc,
            completion_time_utc: None,
        }
    }

    pub fn completion_time_utc(&self) -> Option<DateTime<Utc>> {
        self.completion_time_utc
    }

    pub fn is_complete(&self) -> bool {
        self.completion_time_utc.is_some()
    }

    /// Record the run as finished and return the effective completion time.
    ///
    /// The first call wins; later calls leave the timestamp untouched. The
    /// timestamp is never earlier than `start_time_utc`.
    pub fn mark_complete(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.start_time_utc;
        *self.completion_time_utc.get_or_insert_with(|| at.max(start))
    }
}
