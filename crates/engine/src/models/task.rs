//! Task definitions: the authored, immutable DAG a run is materialized from.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::TaskId;
use crate::EngineError;

/// Reserved by the persistence key scheme; may not appear in a task type.
pub const KEY_SEPARATOR: char = '/';

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// Kind of work a task performs.
///
/// Idempotent tasks may be re-executed when a scheduler crashes while they
/// are in flight; non-idempotent tasks are attempted at most once unless an
/// operator retries them explicitly. `has_delay` allows instances of this
/// type to declare a pre-execution delay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawTaskType")]
pub struct TaskType {
    #[serde(rename = "type")]
    type_name: String,
    version: String,
    is_idempotent: bool,
    has_delay: bool,
}

impl TaskType {
    /// A task type without delay support.
    ///
    /// # Errors
    /// [`EngineError::InvalidArgument`] if `type_name` or `version` contains
    /// [`KEY_SEPARATOR`].
    pub fn new(
        type_name: impl Into<String>,
        version: impl Into<String>,
        is_idempotent: bool,
    ) -> Result<Self, EngineError> {
        Self::with_delay(type_name, version, is_idempotent, false)
    }

    pub fn with_delay(
        type_name: impl Into<String>,
        version: impl Into<String>,
        is_idempotent: bool,
        has_delay: bool,
    ) -> Result<Self, EngineError> {
        let type_name = type_name.into();
        let version = version.into();
        check_component("type", &type_name)?;
        check_component("version", &version)?;

        Ok(Self {
            type_name,
            version,
            is_idempotent,
            has_delay,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_idempotent(&self) -> bool {
        self.is_idempotent
    }

    pub fn has_delay(&self) -> bool {
        self.has_delay
    }

    /// Re-check the separator rule; used when validating graphs.
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        check_component("type", &self.type_name)?;
        check_component("version", &self.version)
    }
}

fn check_component(field: &str, value: &str) -> Result<(), EngineError> {
    if value.contains(KEY_SEPARATOR) {
        return Err(EngineError::InvalidArgument(format!(
            "{field} cannot contain '{KEY_SEPARATOR}': '{value}'"
        )));
    }
    Ok(())
}

/// Wire shape of [`TaskType`]; deserialization goes through the validating
/// constructor. `hasDelay` may be absent in older payloads.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTaskType {
    #[serde(rename = "type")]
    type_name: String,
    version: String,
    is_idempotent: bool,
    #[serde(default)]
    has_delay: bool,
}

impl TryFrom<RawTaskType> for TaskType {
    type Error = EngineError;

    fn try_from(raw: RawTaskType) -> Result<Self, Self::Error> {
        Self::with_delay(raw.type_name, raw.version, raw.is_idempotent, raw.has_delay)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A node of a task-definition graph.
///
/// Children run after their parent completes. A child may be shared by
/// several parents (same `Arc`, or simply the same id), so the definition is
/// a DAG rather than a tree. A task without a type is a grouping node: it
/// only expresses structure and completes without being dispatched.
///
/// Equality is structural over the reachable nodes: ids, types, metadata and
/// children compared as sets, independent of construction order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_type: Option<TaskType>,
    #[serde(default)]
    children_tasks: Vec<Arc<Task>>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        task_type: Option<TaskType>,
        children: Vec<Arc<Task>>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            children_tasks: children,
            metadata,
        }
    }

    /// A typed task with no children and no metadata.
    pub fn leaf(task_id: TaskId, task_type: TaskType) -> Self {
        Self::new(task_id, Some(task_type), Vec::new(), HashMap::new())
    }

    /// A grouping node: no type, only children.
    pub fn group(task_id: TaskId, children: Vec<Arc<Task>>) -> Self {
        Self::new(task_id, None, children, HashMap::new())
    }

    pub fn id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn task_type(&self) -> Option<&TaskType> {
        self.task_type.as_ref()
    }

    pub fn children(&self) -> &[Arc<Task>] {
        &self.children_tasks
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// `true` for nodes that carry real work.
    pub fn is_executable(&self) -> bool {
        self.task_type.is_some()
    }

    /// Ids of the direct children.
    pub fn child_ids(&self) -> BTreeSet<TaskId> {
        self.children_tasks.iter().map(|c| c.task_id.clone()).collect()
    }
}

/// What a node looks like once its children are reduced to an id set.
#[derive(PartialEq)]
struct NodeShape<'a> {
    task_type: Option<&'a TaskType>,
    metadata: &'a HashMap<String, String>,
    children: BTreeSet<&'a TaskId>,
}

/// First-seen shape of every node reachable from `root`, keyed by id.
fn reachable_shapes(root: &Task) -> HashMap<&TaskId, NodeShape<'_>> {
    let mut shapes = HashMap::new();
    let mut seen: HashSet<&TaskId> = HashSet::new();
    let mut stack = vec![root];

    while let Some(task) = stack.pop() {
        if !seen.insert(&task.task_id) {
            continue;
        }
        shapes.insert(
            &task.task_id,
            NodeShape {
                task_type: task.task_type.as_ref(),
                metadata: &task.metadata,
                children: task.children_tasks.iter().map(|c| &c.task_id).collect(),
            },
        );
        stack.extend(task.children_tasks.iter().map(Arc::as_ref));
    }

    shapes
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id && reachable_shapes(self) == reachable_shapes(other)
    }
}

impl Eq for Task {}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_type() -> TaskType {
        TaskType::new("test", "1", true).unwrap()
    }

    fn node(id: &str, children: Vec<Arc<Task>>) -> Arc<Task> {
        Arc::new(Task::new(id.into(), Some(test_type()), children, HashMap::new()))
    }

    #[test]
    fn separator_in_type_is_rejected() {
        let err = TaskType::new("a/b", "1", true).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(msg) if msg.contains("type")));
    }

    #[test]
    fn separator_in_version_is_rejected() {
        assert!(TaskType::with_delay("a", "1/2", false, true).is_err());
    }

    #[test]
    fn task_type_equality_covers_every_field() {
        let base = TaskType::with_delay("t", "1", true, false).unwrap();
        assert_ne!(base, TaskType::with_delay("t", "1", true, true).unwrap());
        assert_ne!(base, TaskType::with_delay("t", "1", false, false).unwrap());
        assert_ne!(base, TaskType::with_delay("t", "2", true, false).unwrap());
        assert_eq!(base, TaskType::new("t", "1", true).unwrap());
    }

    #[test]
    fn deserializing_task_type_validates_separator() {
        let json = r#"{"type":"a/b","version":"1","isIdempotent":true,"hasDelay":false}"#;
        assert!(serde_json::from_str::<TaskType>(json).is_err());
    }

    #[test]
    fn has_delay_defaults_to_false_when_missing() {
        let json = r#"{"type":"a","version":"1","isIdempotent":false}"#;
        let task_type: TaskType = serde_json::from_str(json).unwrap();
        assert!(!task_type.has_delay());
    }

    #[test]
    fn shared_subtask_graphs_are_equal_regardless_of_construction_order() {
        // Both graphs: root -> {task1, task2}; task1/task2 -> {task3, task4, task5};
        // task3/4/5 -> task6. One shares Arcs, the other rebuilds every node.
        let task6 = node("task6", vec![]);
        let shared: Vec<Arc<Task>> = ["task3", "task4", "task5"]
            .iter()
            .map(|id| node(id, vec![task6.clone()]))
            .collect();
        let first = Task::group(
            "root".into(),
            vec![node("task1", shared.clone()), node("task2", shared)],
        );

        let rebuilt = |order: [&str; 3]| -> Vec<Arc<Task>> {
            order
                .iter()
                .map(|id| node(id, vec![node("task6", vec![])]))
                .collect()
        };
        let second = Task::group(
            "root".into(),
            vec![
                node("task2", rebuilt(["task5", "task3", "task4"])),
                node("task1", rebuilt(["task4", "task5", "task3"])),
            ],
        );

        assert_eq!(first, second);
    }

    #[test]
    fn graphs_with_different_metadata_are_not_equal() {
        let a = Task::group("root".into(), vec![node("x", vec![])]);
        let mut metadata = HashMap::new();
        metadata.insert("k".to_string(), "v".to_string());
        let b = Task::group(
            "root".into(),
            vec![Arc::new(Task::new("x".into(), Some(test_type()), vec![], metadata))],
        );
        assert_ne!(a, b);
    }
}
