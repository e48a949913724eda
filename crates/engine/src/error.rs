//! Engine-level error types.

use thiserror::Error;

use crate::models::{RunId, TaskId};
use crate::run_state::TaskState;

/// Errors produced by the workflow engine (validation, scheduling, recovery).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// A constructor argument broke a value-type invariant.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The task definition graph is cyclic, ambiguous or otherwise malformed.
    #[error("invalid task graph: {0}")]
    InvalidGraph(String),

    /// A run already exists under this id.
    #[error("run '{0}' already exists")]
    DuplicateRun(RunId),

    // ------ Scheduling errors ------

    #[error("run '{0}' not found")]
    UnknownRun(RunId),

    #[error("task '{task_id}' is not part of run '{run_id}'")]
    UnknownTask { run_id: RunId, task_id: TaskId },

    /// This scheduler lost its exclusive right to advance the run.
    #[error("lost exclusive lock on run '{0}'")]
    StaleLockLost(RunId),

    /// A state-machine transition that the run model does not allow.
    #[error("task '{task_id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// The execution boundary refused a dispatch.
    #[error("dispatch of task '{task_id}' failed: {message}")]
    Dispatch { task_id: TaskId, message: String },

    // ------ Run-level outcomes ------

    /// One or more tasks of a finished run did not complete successfully.
    #[error("run '{run_id}' finished with failed tasks: {failed:?}")]
    WorkerFailure { run_id: RunId, failed: Vec<TaskId> },

    /// `StartedTask` records with no matching task definition.
    #[error("run '{run_id}' has started records for unknown tasks: {task_ids:?}")]
    RecoveryAmbiguous { run_id: RunId, task_ids: Vec<TaskId> },

    // ------ Infrastructure ------

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistence error from the db crate.
    #[error("store error: {0}")]
    Database(#[from] db::DbError),
}
