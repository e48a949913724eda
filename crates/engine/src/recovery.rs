//! Crash recovery policy.
//!
//! After a scheduler takeover every `Started` task without a result is
//! classified by its type's idempotency: idempotent tasks are dispatched
//! again, non-idempotent ones are held and reported as stalled until an
//! operator retries them or forces a result.
//!
//! A stopped run dispatches nothing: its in-flight tasks are cancelled by
//! the scheduler instead.

use crate::models::{RunId, TaskId};
use crate::run_state::{RunState, TaskState};
use crate::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Idempotent in-flight tasks to dispatch again, with their next attempt.
    pub redispatch: Vec<(TaskId, u32)>,
    /// Non-idempotent in-flight tasks that need manual intervention.
    pub stalled: Vec<TaskId>,
    /// Started records that no longer match a task of the run.
    pub ambiguous: Vec<TaskId>,
}

impl RecoveryPlan {
    pub fn for_run(state: &RunState) -> Self {
        let mut plan = Self {
            ambiguous: state.orphaned_started().to_vec(),
            ..Self::default()
        };

        if state.is_stopped() {
            return plan;
        }

        for task_id in state.tasks_in(TaskState::Started) {
            let idempotent = state.task(&task_id).is_some_and(|t| t.is_idempotent());
            if idempotent {
                let attempt = state.started_record(&task_id).map_or(1, |s| s.attempt);
                plan.redispatch.push((task_id, attempt.saturating_add(1)));
            } else {
                plan.stalled.push(task_id);
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.redispatch.is_empty() && self.stalled.is_empty() && self.ambiguous.is_empty()
    }

    /// Surface orphaned started records as [`EngineError::RecoveryAmbiguous`].
    pub fn check_ambiguous(&self, run_id: &RunId) -> Result<(), EngineError> {
        if self.ambiguous.is_empty() {
            return Ok(());
        }
        Err(EngineError::RecoveryAmbiguous {
            run_id: run_id.clone(),
            task_ids: self.ambiguous.clone(),
        })
    }
}
