//! Per-run state machine: readiness, completion propagation, cancellation.
//!
//! [`RunState`] is rebuilt from persisted data (the [`RunnableTask`] plus the
//! run's `StartedTask` and `TaskExecutionResult` records) and then advanced
//! in memory. It performs no I/O; the scheduler persists each transition
//! through the run store before acting on it.
//!
//! Readiness is tracked incrementally: every task keeps a count of
//! predecessors that have not completed yet, and completing a task only
//! touches its direct dependents.
//!
//! A `FAILED_STOP` result stops the run: every pending task is cancelled at
//! once. Tasks still in flight stay `Started` until the scheduler has recorded
//! their cancellation (or the result that beat it).

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dag::topological_order;
use crate::models::{
    ExecutableTask, RunId, RunnableTask, StartedTask, TaskExecutionResult, TaskExecutionStatus,
    TaskId,
};
use crate::EngineError;

/// Lifecycle of one task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for predecessors, or ready and not yet dispatched.
    Pending,
    /// Dispatched; no result recorded yet.
    Started,
    Completed,
    /// The task reported a failure status.
    Failed,
    /// Terminated by run cancellation or by a run-stopping failure.
    Cancelled,
    /// Can never run because a predecessor did not complete.
    Unreachable,
}

impl TaskState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Started)
    }

    fn from_status(status: TaskExecutionStatus) -> Self {
        match status {
            TaskExecutionStatus::Success => TaskState::Completed,
            TaskExecutionStatus::FailedContinue | TaskExecutionStatus::FailedStop => TaskState::Failed,
            TaskExecutionStatus::Cancelled => TaskState::Cancelled,
        }
    }
}

/// What applying a result changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// `false` when the task was already terminal and the result was dropped.
    pub applied: bool,
    /// Dependents whose last outstanding predecessor just completed.
    pub newly_ready: Vec<TaskId>,
    /// Downstream tasks that can no longer run.
    pub unreachable: Vec<TaskId>,
    /// Pending tasks cancelled because the result stopped the run.
    pub cancelled: Vec<TaskId>,
}

/// Tasks terminated by [`RunState::cancel`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cancellation {
    /// Never dispatched.
    pub pending: Vec<TaskId>,
    /// Dispatched and still in flight; their workers should be signalled.
    pub in_flight: Vec<TaskId>,
}

#[derive(Debug, Clone)]
pub struct RunState {
    run_id: RunId,
    runnable: RunnableTask,
    states: HashMap<TaskId, TaskState>,
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    predecessors: HashMap<TaskId, BTreeSet<TaskId>>,
    /// Predecessors not yet `Completed`.
    waiting_on: HashMap<TaskId, usize>,
    ready: BTreeSet<TaskId>,
    started: HashMap<TaskId, StartedTask>,
    /// Started records for ids the run does not define.
    orphaned: Vec<TaskId>,
    /// A `FAILED_STOP` result was recorded.
    stopped: bool,
    /// Tasks not yet in a terminal state.
    open: usize,
}

impl RunState {
    /// Rebuild run state from its persisted parts.
    ///
    /// # Errors
    /// [`EngineError::InvalidGraph`] if the dags reference unknown tasks or
    /// form a cycle.
    pub fn restore(
        run_id: RunId,
        runnable: RunnableTask,
        started: HashMap<TaskId, StartedTask>,
        results: HashMap<TaskId, TaskExecutionResult>,
    ) -> Result<Self, EngineError> {
        let mut dependents: HashMap<TaskId, BTreeSet<TaskId>> = HashMap::new();
        let mut predecessors: HashMap<TaskId, BTreeSet<TaskId>> = HashMap::new();

        for dag in &runnable.task_dags {
            for id in std::iter::once(&dag.task_id).chain(&dag.dependent_task_ids) {
                if !runnable.tasks.contains_key(id) {
                    return Err(EngineError::InvalidGraph(format!(
                        "run '{run_id}' references undefined task '{id}'"
                    )));
                }
            }
            for dependent in &dag.dependent_task_ids {
                dependents
                    .entry(dag.task_id.clone())
                    .or_default()
                    .insert(dependent.clone());
                predecessors
                    .entry(dependent.clone())
                    .or_default()
                    .insert(dag.task_id.clone());
            }
        }

        let mut order = topological_order(&runnable.task_dags)?;
        let dagged: HashSet<&TaskId> = order.iter().collect();
        let mut undagged: Vec<TaskId> = runnable
            .tasks
            .keys()
            .filter(|id| !dagged.contains(id))
            .cloned()
            .collect();
        undagged.sort();
        order.extend(undagged);

        // Recorded facts first: results win over started markers.
        let mut states: HashMap<TaskId, TaskState> = HashMap::new();
        let mut stopped = false;
        for id in runnable.tasks.keys() {
            let state = match results.get(id) {
                Some(result) => {
                    stopped |= result.status == TaskExecutionStatus::FailedStop;
                    TaskState::from_status(result.status)
                }
                None if started.contains_key(id) => TaskState::Started,
                None => TaskState::Pending,
            };
            states.insert(id.clone(), state);
        }

        for id in results.keys().filter(|id| !runnable.tasks.contains_key(*id)) {
            warn!(run_id = %run_id, task_id = %id, "ignoring result for task outside the run");
        }

        let mut orphaned: Vec<TaskId> = started
            .keys()
            .filter(|id| !runnable.tasks.contains_key(*id))
            .cloned()
            .collect();
        orphaned.sort();

        // Derived states, in dependency order so unreachability cascades.
        let mut waiting_on = HashMap::new();
        let mut ready = BTreeSet::new();
        for id in &order {
            let preds = predecessors.get(id);
            let waiting = preds
                .map(|p| p.iter().filter(|p| states[*p] != TaskState::Completed).count())
                .unwrap_or(0);
            waiting_on.insert(id.clone(), waiting);

            if states[id] != TaskState::Pending {
                continue;
            }
            let preds: Vec<&TaskId> = preds.into_iter().flatten().collect();
            // Behind a continuing failure the task was unreachable before any
            // stop could cancel it.
            let cut_off = preds.iter().any(|p| {
                states[*p] == TaskState::Unreachable
                    || results
                        .get(*p)
                        .is_some_and(|r| r.status == TaskExecutionStatus::FailedContinue)
            });
            let blocked = preds
                .iter()
                .any(|p| matches!(states[*p], TaskState::Failed | TaskState::Cancelled));

            if cut_off {
                states.insert(id.clone(), TaskState::Unreachable);
            } else if stopped {
                states.insert(id.clone(), TaskState::Cancelled);
            } else if blocked {
                states.insert(id.clone(), TaskState::Unreachable);
            } else if waiting == 0 {
                ready.insert(id.clone());
            }
        }
        let open = states.values().filter(|s| !s.is_terminal()).count();

        debug!(
            run_id = %run_id,
            tasks = states.len(),
            ready = ready.len(),
            open,
            stopped,
            "restored run state"
        );

        Ok(Self {
            run_id,
            runnable,
            states,
            dependents,
            predecessors,
            waiting_on,
            ready,
            started,
            orphaned,
            stopped,
            open,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn runnable(&self) -> &RunnableTask {
        &self.runnable
    }

    pub fn runnable_mut(&mut self) -> &mut RunnableTask {
        &mut self.runnable
    }

    pub fn state_of(&self, task_id: &TaskId) -> Option<TaskState> {
        self.states.get(task_id).copied()
    }

    pub fn states(&self) -> &HashMap<TaskId, TaskState> {
        &self.states
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&ExecutableTask> {
        self.runnable.tasks.get(task_id)
    }

    /// Direct predecessors of a task (inverse of the dag adjacency).
    pub fn predecessors_of(&self, task_id: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.predecessors.get(task_id).into_iter().flatten()
    }

    pub fn started_record(&self, task_id: &TaskId) -> Option<&StartedTask> {
        self.started.get(task_id)
    }

    /// Started records that match no task of this run.
    pub fn orphaned_started(&self) -> &[TaskId] {
        &self.orphaned
    }

    /// Pending tasks whose predecessors have all completed, in id order.
    pub fn ready_tasks(&self) -> Vec<&ExecutableTask> {
        self.ready
            .iter()
            .filter_map(|id| self.runnable.tasks.get(id))
            .collect()
    }

    /// Tasks dispatched and awaiting a result, in id order.
    pub fn in_flight(&self) -> Vec<&TaskId> {
        let mut ids: Vec<&TaskId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == TaskState::Started)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    pub fn tasks_in(&self, state: TaskState) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.open == 0
    }

    /// A `FAILED_STOP` result was applied; nothing new may start.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Every task completed successfully.
    pub fn is_successful(&self) -> bool {
        self.states.values().all(|s| *s == TaskState::Completed)
    }

    /// `Pending → Started` for a ready task.
    pub fn mark_started(&mut self, task_id: &TaskId, record: StartedTask) -> Result<(), EngineError> {
        let from = self.current(task_id)?;
        if !self.ready.contains(task_id) {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.clone(),
                from,
                to: TaskState::Started,
            });
        }

        self.ready.remove(task_id);
        self.set_state(task_id, TaskState::Started);
        self.started.insert(task_id.clone(), record);
        Ok(())
    }

    /// Record a fresh attempt for a task that is already `Started`.
    pub fn record_attempt(&mut self, task_id: &TaskId, record: StartedTask) -> Result<(), EngineError> {
        let from = self.current(task_id)?;
        if from != TaskState::Started {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.clone(),
                from,
                to: TaskState::Started,
            });
        }
        self.started.insert(task_id.clone(), record);
        Ok(())
    }

    /// `Pending → Completed` for a ready grouping node.
    pub fn complete_grouping(&mut self, task_id: &TaskId) -> Result<Vec<TaskId>, EngineError> {
        let from = self.current(task_id)?;
        let is_grouping = self.task(task_id).is_some_and(|t| !t.is_executable);
        if !is_grouping || !self.ready.contains(task_id) {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.clone(),
                from,
                to: TaskState::Completed,
            });
        }

        self.ready.remove(task_id);
        Ok(self.complete(task_id))
    }

    /// Apply a worker's result to a `Started` task.
    ///
    /// Results for tasks that are already terminal are ignored, which makes
    /// duplicate and late deliveries harmless. A `Pending` task only accepts
    /// `Cancelled`.
    pub fn apply_result(
        &mut self,
        task_id: &TaskId,
        result: &TaskExecutionResult,
    ) -> Result<Transition, EngineError> {
        let from = self.current(task_id)?;
        let to = TaskState::from_status(result.status);

        if from.is_terminal() {
            debug!(
                run_id = %self.run_id,
                task_id = %task_id,
                state = ?from,
                "ignoring result for terminal task"
            );
            return Ok(Transition::default());
        }
        if from == TaskState::Pending && to != TaskState::Cancelled {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.clone(),
                from,
                to,
            });
        }

        self.ready.remove(task_id);
        let mut transition = Transition {
            applied: true,
            ..Transition::default()
        };

        match result.status {
            TaskExecutionStatus::Success => {
                transition.newly_ready = self.complete(task_id);
            }
            TaskExecutionStatus::FailedContinue | TaskExecutionStatus::Cancelled => {
                self.set_state(task_id, to);
                transition.unreachable = self.mark_unreachable_from(task_id);
            }
            TaskExecutionStatus::FailedStop => {
                self.set_state(task_id, to);
                self.stopped = true;
                transition.cancelled = self.cancel_pending();
            }
        }

        Ok(transition)
    }

    /// Terminate every non-terminal task.
    pub fn cancel(&mut self) -> Cancellation {
        let pending = self.cancel_pending();
        let in_flight: Vec<TaskId> = self.in_flight().into_iter().cloned().collect();
        for id in &in_flight {
            self.set_state(id, TaskState::Cancelled);
        }
        Cancellation { pending, in_flight }
    }

    fn current(&self, task_id: &TaskId) -> Result<TaskState, EngineError> {
        self.state_of(task_id).ok_or_else(|| EngineError::UnknownTask {
            run_id: self.run_id.clone(),
            task_id: task_id.clone(),
        })
    }

    fn set_state(&mut self, task_id: &TaskId, to: TaskState) {
        let from = self.states.insert(task_id.clone(), to);
        if from.is_some_and(|s| !s.is_terminal()) && to.is_terminal() {
            self.open = self.open.saturating_sub(1);
        }
    }

    /// Mark completed and release dependents. Returns the newly ready ones.
    fn complete(&mut self, task_id: &TaskId) -> Vec<TaskId> {
        self.set_state(task_id, TaskState::Completed);

        let mut newly_ready = Vec::new();
        let Some(dependents) = self.dependents.get(task_id) else {
            return newly_ready;
        };

        for dependent in dependents {
            let Some(waiting) = self.waiting_on.get_mut(dependent) else {
                continue;
            };
            *waiting = waiting.saturating_sub(1);
            if *waiting == 0 && self.states.get(dependent) == Some(&TaskState::Pending) {
                self.ready.insert(dependent.clone());
                newly_ready.push(dependent.clone());
            }
        }

        newly_ready
    }

    /// Every pending task downstream of `task_id` becomes `Unreachable`.
    fn mark_unreachable_from(&mut self, task_id: &TaskId) -> Vec<TaskId> {
        let mut stack: Vec<TaskId> = self
            .dependents
            .get(task_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        let mut unreachable = Vec::new();

        while let Some(id) = stack.pop() {
            if self.states.get(&id) != Some(&TaskState::Pending) {
                continue;
            }
            self.set_state(&id, TaskState::Unreachable);
            self.ready.remove(&id);
            if let Some(next) = self.dependents.get(&id) {
                stack.extend(next.iter().cloned());
            }
            unreachable.push(id);
        }

        unreachable.sort();
        unreachable
    }

    fn cancel_pending(&mut self) -> Vec<TaskId> {
        let pending = self.tasks_in(TaskState::Pending);
        for id in &pending {
            self.set_state(id, TaskState::Cancelled);
        }
        self.ready.clear();
        pending
    }
}
