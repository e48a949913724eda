//! `engine` crate — task graphs, run materialization, the run state machine
//! and the workflow scheduler.

pub mod config;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod materialize;
pub mod models;
pub mod recovery;
pub mod report;
pub mod run_state;
pub mod scheduler;
pub mod store;

pub use config::SchedulerConfig;
pub use dag::{topological_order, validate_task_graph, TaskGraph};
pub use dispatch::TaskDispatcher;
pub use error::EngineError;
pub use materialize::{materialize, RunParameters};
pub use models::{
    ExecutableTask, RunId, RunnableTask, RunnableTaskDag, StartedTask, Task, TaskExecutionResult,
    TaskExecutionStatus, TaskId, TaskType,
};
pub use recovery::RecoveryPlan;
pub use report::{RunOutcome, RunReport};
pub use run_state::{RunState, TaskState};
pub use scheduler::{Advance, RunProgress, WorkflowScheduler};
pub use store::RunStore;

#[cfg(test)]
mod scheduler_tests;
