//! Typed access to run data in the coordination store.
//!
//! Key layout:
//!
//! ```text
//! /runs/{run_id}                  RunnableTask
//! /started/{run_id}/{task_id}     StartedTask
//! /completed/{run_id}/{task_id}   TaskExecutionResult
//! ```
//!
//! Values are JSON. Lock names are `run/{run_id}` per run and `leader` for
//! scheduler election.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use db::{CoordinationStore, DbError, Expect, Fence};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{RunId, RunnableTask, StartedTask, TaskExecutionResult, TaskId, KEY_SEPARATOR};
use crate::run_state::RunState;
use crate::EngineError;

pub const RUNS_PREFIX: &str = "/runs/";
pub const STARTED_PREFIX: &str = "/started/";
pub const COMPLETED_PREFIX: &str = "/completed/";
pub const LEADER_LOCK: &str = "leader";

fn run_key(run_id: &RunId) -> String {
    format!("{RUNS_PREFIX}{run_id}")
}

fn started_prefix(run_id: &RunId) -> String {
    format!("{STARTED_PREFIX}{run_id}{KEY_SEPARATOR}")
}

fn completed_prefix(run_id: &RunId) -> String {
    format!("{COMPLETED_PREFIX}{run_id}{KEY_SEPARATOR}")
}

fn run_lock(run_id: &RunId) -> String {
    format!("run{KEY_SEPARATOR}{run_id}")
}

fn encode<T: Serialize>(value: &T) -> Result<String, EngineError> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, EngineError> {
    Ok(serde_json::from_str(raw)?)
}

/// Fenced writes that fail because the lease moved on mean this scheduler no
/// longer owns the run.
fn fenced(run_id: &RunId, err: DbError) -> EngineError {
    match err {
        DbError::LockLost { .. } | DbError::VersionConflict { .. } => {
            EngineError::StaleLockLost(run_id.clone())
        }
        other => EngineError::Database(other),
    }
}

/// Run-level view over a [`CoordinationStore`].
#[derive(Clone)]
pub struct RunStore {
    store: Arc<dyn CoordinationStore>,
}

impl RunStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn coordination(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// The run a store key belongs to, for any run-data key.
    pub fn run_of(key: &str) -> Option<RunId> {
        let rest = [RUNS_PREFIX, STARTED_PREFIX, COMPLETED_PREFIX]
            .iter()
            .find_map(|prefix| key.strip_prefix(prefix))?;
        let run = rest.split(KEY_SEPARATOR).next().filter(|r| !r.is_empty())?;
        Some(RunId::from(run))
    }

    /// Run and task of a completed-task key.
    pub fn completed_task_of(key: &str) -> Option<(RunId, TaskId)> {
        let (run, task) = key.strip_prefix(COMPLETED_PREFIX)?.split_once(KEY_SEPARATOR)?;
        if run.is_empty() || task.is_empty() {
            return None;
        }
        Some((RunId::from(run), TaskId::from(task)))
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Persist a freshly materialized run.
    ///
    /// # Errors
    /// [`EngineError::DuplicateRun`] if the id is taken,
    /// [`EngineError::InvalidArgument`] if it contains the key separator.
    pub async fn create_run(&self, run_id: &RunId, runnable: &RunnableTask) -> Result<(), EngineError> {
        if run_id.as_str().is_empty() || run_id.as_str().contains(KEY_SEPARATOR) {
            return Err(EngineError::InvalidArgument(format!(
                "run id '{run_id}' must be non-empty and must not contain '{KEY_SEPARATOR}'"
            )));
        }

        match self
            .store
            .put(&run_key(run_id), encode(runnable)?, Expect::Absent, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(DbError::AlreadyExists(_)) => Err(EngineError::DuplicateRun(run_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a run's snapshot and its current version.
    pub async fn load_run(&self, run_id: &RunId) -> Result<(RunnableTask, u64), EngineError> {
        let stored = self
            .store
            .get(&run_key(run_id))
            .await?
            .ok_or_else(|| EngineError::UnknownRun(run_id.clone()))?;
        Ok((decode(&stored.value)?, stored.version))
    }

    /// Compare-and-set the run snapshot under the run's lock.
    pub async fn update_run(
        &self,
        run_id: &RunId,
        runnable: &RunnableTask,
        version: u64,
        fence: &Fence,
    ) -> Result<u64, EngineError> {
        self.store
            .put(&run_key(run_id), encode(runnable)?, Expect::Version(version), Some(fence))
            .await
            .map_err(|e| fenced(run_id, e))
    }

    /// Runs whose completion time is not yet recorded.
    pub async fn unfinished_runs(&self) -> Result<Vec<RunId>, EngineError> {
        let entries = self.store.list(RUNS_PREFIX).await?;
        let mut unfinished = Vec::new();
        for (key, stored) in entries {
            let Some(run) = key.strip_prefix(RUNS_PREFIX) else {
                continue;
            };
            match decode::<RunnableTask>(&stored.value) {
                Ok(runnable) if !runnable.is_complete() => unfinished.push(RunId::from(run)),
                Ok(_) => {}
                Err(e) => warn!(run_id = run, error = %e, "skipping undecodable run"),
            }
        }
        Ok(unfinished)
    }

    /// Rebuild the in-memory state of a run from everything stored for it.
    pub async fn restore(&self, run_id: &RunId) -> Result<(RunState, u64), EngineError> {
        let (runnable, version) = self.load_run(run_id).await?;
        let started = self.started_tasks(run_id).await?;
        let results = self.results(run_id).await?;
        let state = RunState::restore(run_id.clone(), runnable, started, results)?;
        Ok((state, version))
    }

    /// Delete every key of a run.
    pub async fn purge_run(&self, run_id: &RunId, fence: &Fence) -> Result<(), EngineError> {
        for prefix in [started_prefix(run_id), completed_prefix(run_id)] {
            for (key, _) in self.store.list(&prefix).await? {
                self.store
                    .delete(&key, Some(fence))
                    .await
                    .map_err(|e| fenced(run_id, e))?;
            }
        }
        self.store
            .delete(&run_key(run_id), Some(fence))
            .await
            .map_err(|e| fenced(run_id, e))?;

        debug!(run_id = %run_id, "purged run");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn started_tasks(&self, run_id: &RunId) -> Result<HashMap<TaskId, StartedTask>, EngineError> {
        self.task_records(&started_prefix(run_id)).await
    }

    pub async fn results(&self, run_id: &RunId) -> Result<HashMap<TaskId, TaskExecutionResult>, EngineError> {
        self.task_records(&completed_prefix(run_id)).await
    }

    pub async fn result(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<Option<TaskExecutionResult>, EngineError> {
        let key = format!("{}{task_id}", completed_prefix(run_id));
        match self.store.get(&key).await? {
            Some(stored) => Ok(Some(decode(&stored.value)?)),
            None => Ok(None),
        }
    }

    /// Record a dispatch. Must be durable before the task is handed out.
    pub async fn start_task(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        started: &StartedTask,
        fence: &Fence,
    ) -> Result<(), EngineError> {
        let key = format!("{}{task_id}", started_prefix(run_id));
        self.store
            .put(&key, encode(started)?, Expect::Any, Some(fence))
            .await
            .map_err(|e| fenced(run_id, e))?;
        Ok(())
    }

    /// Record a task's result. The first result for a task wins.
    ///
    /// Returns `false` when a result was already present, in which case
    /// nothing is written.
    pub async fn complete_task(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        result: &TaskExecutionResult,
        fence: Option<&Fence>,
    ) -> Result<bool, EngineError> {
        let key = format!("{}{task_id}", completed_prefix(run_id));
        match self.store.put(&key, encode(result)?, Expect::Absent, fence).await {
            Ok(_) => Ok(true),
            Err(DbError::AlreadyExists(_)) => {
                debug!(run_id = %run_id, task_id = %task_id, "result already recorded; ignoring");
                Ok(false)
            }
            Err(e) => Err(fenced(run_id, e)),
        }
    }

    async fn task_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<HashMap<TaskId, T>, EngineError> {
        let mut records = HashMap::new();
        for (key, stored) in self.store.list(prefix).await? {
            if let Some(task) = key.strip_prefix(prefix) {
                records.insert(TaskId::from(task), decode(&stored.value)?);
            }
        }
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    pub async fn lock_run(&self, run_id: &RunId, owner: &str, ttl: Duration) -> Result<Option<Fence>, EngineError> {
        Ok(self.store.acquire_lock(&run_lock(run_id), owner, ttl).await?)
    }

    pub async fn acquire_leadership(&self, owner: &str, ttl: Duration) -> Result<Option<Fence>, EngineError> {
        Ok(self.store.acquire_lock(LEADER_LOCK, owner, ttl).await?)
    }

    pub async fn renew(&self, fence: &Fence, ttl: Duration) -> Result<Fence, EngineError> {
        Ok(self.store.renew_lock(fence, ttl).await?)
    }

    pub async fn release(&self, fence: &Fence) {
        if let Err(e) = self.store.release_lock(fence).await {
            warn!(lock = %fence.lock, error = %e, "failed to release lock");
        }
    }
}
