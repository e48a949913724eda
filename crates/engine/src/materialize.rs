//! Run materialization: definition graph + overrides → [`RunnableTask`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::TaskGraph;
use crate::models::{ExecutableTask, RunId, RunnableTask, Task, TaskId};
use crate::EngineError;

/// Run-time parameter overrides.
///
/// Precedence when merging into a task's parameters, lowest first: the
/// task's own metadata, `run_wide`, then the task's entry in `per_task`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParameters {
    #[serde(default)]
    pub run_wide: HashMap<String, String>,
    #[serde(default)]
    pub per_task: HashMap<TaskId, HashMap<String, String>>,
}

impl RunParameters {
    fn merged_for(&self, task: &Task) -> HashMap<String, String> {
        let mut parameters = task.metadata().clone();
        parameters.extend(self.run_wide.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(overrides) = self.per_task.get(task.id()) {
            parameters.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        parameters
    }
}

/// Materialize `root` into the runnable snapshot for `run_id`, started now.
///
/// # Errors
/// [`EngineError::InvalidGraph`] if the graph fails validation. Nothing is
/// produced in that case.
pub fn materialize(
    run_id: &RunId,
    root: &Task,
    parameters: &RunParameters,
) -> Result<RunnableTask, EngineError> {
    materialize_at(run_id, root, parameters, Utc::now())
}

/// [`materialize`] with an explicit start time.
pub fn materialize_at(
    run_id: &RunId,
    root: &Task,
    parameters: &RunParameters,
    start_time_utc: DateTime<Utc>,
) -> Result<RunnableTask, EngineError> {
    let graph = TaskGraph::build(root)?;
    Ok(from_graph(run_id, graph, parameters, start_time_utc))
}

/// Materialize an already validated graph.
pub(crate) fn from_graph(
    run_id: &RunId,
    graph: TaskGraph<'_>,
    parameters: &RunParameters,
    start_time_utc: DateTime<Utc>,
) -> RunnableTask {
    let tasks: HashMap<TaskId, ExecutableTask> = graph
        .nodes()
        .iter()
        .map(|task| {
            let executable = ExecutableTask {
                run_id: run_id.clone(),
                task_id: task.id().clone(),
                task_type: task.task_type().cloned(),
                parameters: parameters.merged_for(task),
                is_executable: task.is_executable(),
            };
            (task.id().clone(), executable)
        })
        .collect();

    debug!(
        run_id = %run_id,
        tasks = tasks.len(),
        "materialized run from definition graph"
    );

    RunnableTask::new(tasks, graph.into_dags(), start_time_utc)
}
