//! Task type → executor lookup.

use std::collections::HashMap;
use std::sync::Arc;

use engine::TaskType;
use worker::TaskExecutor;

/// Executors keyed by task type name, optionally pinned to a version.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    by_type: HashMap<String, Arc<dyn TaskExecutor>>,
    by_version: HashMap<(String, String), Arc<dyn TaskExecutor>>,
    fallback: Option<Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle every version of `type_name`.
    pub fn register(mut self, type_name: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        self.by_type.insert(type_name.into(), executor);
        self
    }

    /// Handle one version of `type_name`; takes precedence over
    /// [`register`](Self::register).
    pub fn register_version(
        mut self,
        type_name: impl Into<String>,
        version: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        self.by_version.insert((type_name.into(), version.into()), executor);
        self
    }

    /// Used when nothing more specific matches.
    pub fn with_fallback(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn resolve(&self, task_type: &TaskType) -> Option<Arc<dyn TaskExecutor>> {
        let key = (task_type.type_name().to_owned(), task_type.version().to_owned());
        self.by_version
            .get(&key)
            .or_else(|| self.by_type.get(task_type.type_name()))
            .or(self.fallback.as_ref())
            .cloned()
    }
}
