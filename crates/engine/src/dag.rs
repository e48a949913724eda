//! Task-graph validation — run this before materializing a run.
//!
//! Rules enforced:
//! 1. Every task type respects the key separator rule.
//! 2. Nodes sharing a `TaskId` must agree on type, metadata and children;
//!    a shared subtask is the same node reached from several parents, not
//!    two different nodes with one name.
//! 3. The dependency relation must be acyclic (topological sort must succeed).
//!
//! Each node value is walked once, however many parents reach it. Separately
//! built copies of a node are walked too, so conflicting descendants are
//! caught wherever they sit.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::models::{RunnableTaskDag, Task, TaskId};
use crate::EngineError;

/// A validated definition graph, flattened by id.
#[derive(Debug)]
pub struct TaskGraph<'a> {
    nodes: Vec<&'a Task>,
    dags: Vec<RunnableTaskDag>,
    order: Vec<TaskId>,
}

impl<'a> TaskGraph<'a> {
    /// Flatten and validate the graph rooted at `root`.
    ///
    /// # Errors
    /// [`EngineError::InvalidGraph`] for separator violations, ambiguous ids
    /// or cycles.
    pub fn build(root: &'a Task) -> Result<Self, EngineError> {
        let nodes = flatten(root)?;
        let dags: Vec<RunnableTaskDag> = nodes
            .iter()
            .map(|task| RunnableTaskDag::new(task.id().clone(), task.child_ids()))
            .collect();
        let order = topological_order(&dags)?;

        Ok(Self { nodes, dags, order })
    }

    /// Distinct nodes in discovery order (root first).
    pub fn nodes(&self) -> &[&'a Task] {
        &self.nodes
    }

    /// One adjacency record per distinct node, in discovery order.
    pub fn dags(&self) -> &[RunnableTaskDag] {
        &self.dags
    }

    /// Node ids in an order where every task comes after all of its
    /// predecessors.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    pub fn into_dags(self) -> Vec<RunnableTaskDag> {
        self.dags
    }
}

/// Validate the definition graph and return its nodes in execution order.
pub fn validate_task_graph(root: &Task) -> Result<Vec<TaskId>, EngineError> {
    Ok(TaskGraph::build(root)?.order)
}

/// Walk every node value once, checking separator and identity rules.
fn flatten(root: &Task) -> Result<Vec<&Task>, EngineError> {
    let mut by_id: HashMap<&TaskId, &Task> = HashMap::new();
    let mut walked: HashSet<*const Task> = HashSet::new();
    let mut nodes: Vec<&Task> = Vec::new();
    let mut stack: Vec<&Task> = vec![root];

    while let Some(task) = stack.pop() {
        if !walked.insert(task as *const Task) {
            continue;
        }

        if let Some(&seen) = by_id.get(task.id()) {
            if !same_definition(seen, task) {
                return Err(EngineError::InvalidGraph(format!(
                    "task id '{}' is used by nodes with different definitions",
                    task.id()
                )));
            }
            // A copy of a known node: its children must agree as well.
            stack.extend(task.children().iter().map(|c| c.as_ref()));
            continue;
        }

        if let Some(task_type) = task.task_type() {
            task_type
                .validate()
                .map_err(|e| EngineError::InvalidGraph(format!("task '{}': {e}", task.id())))?;
        }

        by_id.insert(task.id(), task);
        nodes.push(task);

        // Reverse so children are discovered in declaration order.
        stack.extend(task.children().iter().rev().map(|c| c.as_ref()));
    }

    Ok(nodes)
}

fn same_definition(a: &Task, b: &Task) -> bool {
    a.task_type() == b.task_type() && a.metadata() == b.metadata() && a.child_ids() == b.child_ids()
}

/// Topologically sort the dependency relation described by `dags`
/// (Kahn's algorithm).
///
/// Ties are broken by the order in which ids first appear in `dags`, so the
/// result is deterministic.
///
/// # Errors
/// [`EngineError::InvalidGraph`] if the relation contains a cycle.
pub fn topological_order(dags: &[RunnableTaskDag]) -> Result<Vec<TaskId>, EngineError> {
    // Build adjacency list and in-degree map, remembering first-seen order.
    let mut ids: Vec<&TaskId> = Vec::new();
    let mut adjacency: HashMap<&TaskId, BTreeSet<&TaskId>> = HashMap::new();
    let mut in_degree: HashMap<&TaskId, usize> = HashMap::new();

    for dag in dags {
        if !in_degree.contains_key(&dag.task_id) {
            ids.push(&dag.task_id);
            in_degree.insert(&dag.task_id, 0);
        }
        let targets = adjacency.entry(&dag.task_id).or_default();
        for dependent in &dag.dependent_task_ids {
            if targets.insert(dependent) {
                if !in_degree.contains_key(dependent) {
                    ids.push(dependent);
                    in_degree.insert(dependent, 0);
                }
                *in_degree.entry(dependent).or_insert(0) += 1;
            }
        }
    }

    // Seed the queue with nodes that have no incoming edges.
    let mut queue: VecDeque<&TaskId> = ids
        .iter()
        .copied()
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut sorted: Vec<TaskId> = Vec::with_capacity(ids.len());

    while let Some(id) = queue.pop_front() {
        sorted.push(id.clone());

        if let Some(neighbours) = adjacency.get(id) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != ids.len() {
        let stuck: Vec<String> = ids
            .iter()
            .filter(|id| in_degree[*id] > 0)
            .map(|id| id.to_string())
            .collect();
        return Err(EngineError::InvalidGraph(format!(
            "dependency cycle through {}",
            stuck.join(", ")
        )));
    }

    Ok(sorted)
}
