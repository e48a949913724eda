//! Run-completion reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{RunId, TaskId};
use crate::run_state::{RunState, TaskState};
use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Every task completed.
    Succeeded,
    /// At least one task failed or became unreachable.
    PartiallyFailed,
    Cancelled,
}

/// Summary of a finished run, grouped by terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub outcome: RunOutcome,
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub unreachable: Vec<TaskId>,
    pub cancelled: Vec<TaskId>,
    pub start_time_utc: DateTime<Utc>,
    pub completion_time_utc: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn from_state(state: &RunState) -> Self {
        let failed = state.tasks_in(TaskState::Failed);
        let unreachable = state.tasks_in(TaskState::Unreachable);
        let cancelled = state.tasks_in(TaskState::Cancelled);

        // A run stopped by a failing task is reported as a failure, not a
        // cancellation.
        let outcome = if !failed.is_empty() || !unreachable.is_empty() {
            RunOutcome::PartiallyFailed
        } else if !cancelled.is_empty() {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Succeeded
        };

        Self {
            run_id: state.run_id().clone(),
            outcome,
            completed: state.tasks_in(TaskState::Completed),
            failed,
            unreachable,
            cancelled,
            start_time_utc: state.runnable().start_time_utc,
            completion_time_utc: state.runnable().completion_time_utc(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// `Ok(self)` for a successful run, otherwise
    /// [`EngineError::WorkerFailure`] naming the tasks that did not complete.
    pub fn into_result(self) -> Result<Self, EngineError> {
        if self.is_success() {
            return Ok(self);
        }

        let mut failed: Vec<TaskId> = self
            .failed
            .iter()
            .chain(&self.unreachable)
            .chain(&self.cancelled)
            .cloned()
            .collect();
        failed.sort();
        Err(EngineError::WorkerFailure {
            run_id: self.run_id,
            failed,
        })
    }
}
