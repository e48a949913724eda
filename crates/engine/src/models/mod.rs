//! Core domain models for the workflow engine.
//!
//! Every type here serialises to the JSON stored by the run store, with
//! stable camelCase field names.

pub mod execution;
pub mod ids;
pub mod runnable;
pub mod task;

pub use execution::{StartedTask, TaskExecutionResult, TaskExecutionStatus};
pub use ids::{RunId, TaskId};
pub use runnable::{ExecutableTask, RunnableTask, RunnableTaskDag, DELAY_MS_PARAMETER};
pub use task::{Task, TaskType, KEY_SEPARATOR};
