//! Fixed-size worker pool.
//!
//! `WorkerPool` is the engine's [`TaskDispatcher`]:
//! 1. `dispatch` resolves an executor for the task's type and enqueues the
//!    job on a bounded channel. An unknown type is refused up front.
//! 2. Each worker pulls jobs, runs them with in-place retries for
//!    `WorkerError::Retryable` (exponential back-off, up to `max_retries`).
//! 3. The outcome is written to the run store as the task's
//!    `TaskExecutionResult`. A fatal error or exhausted retries becomes a
//!    `FAILED_CONTINUE` result.
//!
//! Jobs of cancelled tasks that have not started yet are dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::{EngineError, ExecutableTask, RunId, RunStore, TaskDispatcher, TaskExecutionResult, TaskId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use worker::{ExecutionContext, TaskExecutor, WorkerError};

use crate::{ExecutorRegistry, QueueError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Maximum number of times a retryable failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
    /// Jobs buffered before `dispatch` waits for a free slot.
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            queue_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

struct Job {
    task: ExecutableTask,
    attempt: u32,
    executor: Arc<dyn TaskExecutor>,
}

/// State shared by every worker.
struct Shared {
    config: WorkerPoolConfig,
    store: RunStore,
    jobs: Mutex<mpsc::Receiver<Job>>,
    cancelled: Mutex<HashSet<(RunId, TaskId)>>,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    registry: ExecutorRegistry,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the workers. Must be called within a tokio runtime.
    pub fn start(config: WorkerPoolConfig, registry: ExecutorRegistry, store: RunStore) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let workers = config.workers.max(1);
        let shared = Arc::new(Shared {
            config,
            store,
            jobs: Mutex::new(receiver),
            cancelled: Mutex::new(HashSet::new()),
        });

        let handles = (0..workers)
            .map(|index| tokio::spawn(worker_loop(index, shared.clone())))
            .collect();
        info!(workers, "worker pool started");

        Self {
            registry,
            sender: Mutex::new(Some(sender)),
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// Stop accepting work, let the workers drain the queue, and wait for them.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.sender.lock().await.take();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let mut outcome = Ok(());
        for (worker, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker, error = %e, "worker stopped abnormally");
                outcome = Err(QueueError::WorkerStopped {
                    worker,
                    message: e.to_string(),
                });
            }
        }
        info!("worker pool stopped");
        outcome
    }

    fn executor_for(&self, task: &ExecutableTask) -> Result<Arc<dyn TaskExecutor>, QueueError> {
        let task_type = task
            .task_type
            .as_ref()
            .filter(|_| task.is_executable)
            .ok_or_else(|| QueueError::NotExecutable(task.task_id.to_string()))?;
        self.registry
            .resolve(task_type)
            .ok_or_else(|| QueueError::NoExecutor(task_type.type_name().to_owned()))
    }

    async fn enqueue(&self, task: ExecutableTask, attempt: u32) -> Result<(), QueueError> {
        let executor = self.executor_for(&task)?;
        let sender = self.sender.lock().await.clone().ok_or(QueueError::Closed)?;

        // A fresh attempt supersedes an earlier cancellation signal.
        self.shared
            .cancelled
            .lock()
            .await
            .remove(&(task.run_id.clone(), task.task_id.clone()));

        sender
            .send(Job {
                task,
                attempt,
                executor,
            })
            .await
            .map_err(|_| QueueError::Closed)
    }
}

#[async_trait]
impl TaskDispatcher for WorkerPool {
    async fn dispatch(&self, task: ExecutableTask, attempt: u32) -> Result<(), EngineError> {
        let task_id = task.task_id.clone();
        self.enqueue(task, attempt).await.map_err(|e| EngineError::Dispatch {
            task_id,
            message: e.to_string(),
        })
    }

    async fn cancel(&self, run_id: &RunId, task_id: &TaskId) {
        debug!(run_id = %run_id, task_id = %task_id, "cancellation signalled");
        self.shared
            .cancelled
            .lock()
            .await
            .insert((run_id.clone(), task_id.clone()));
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn worker_loop(index: usize, shared: Arc<Shared>) {
    loop {
        // Hold the receiver only while waiting, so other workers can run jobs.
        let job = shared.jobs.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker = index, "queue closed; worker exiting");
            return;
        };
        run_job(index, &shared, job).await;
    }
}

#[instrument(skip_all, fields(worker = index, run_id = %job.task.run_id, task_id = %job.task.task_id, attempt = job.attempt))]
async fn run_job(index: usize, shared: &Shared, job: Job) {
    let key = (job.task.run_id.clone(), job.task.task_id.clone());
    if shared.cancelled.lock().await.remove(&key) {
        info!("skipping cancelled task");
        return;
    }

    let result = execute_with_retry(index, &shared.config, job.executor.as_ref(), &job.task, job.attempt).await;
    let status = result.status;

    match shared
        .store
        .complete_task(&job.task.run_id, &job.task.task_id, &result, None)
        .await
    {
        Ok(true) => info!(?status, "task finished"),
        Ok(false) => debug!(?status, "task already had a result; outcome dropped"),
        // The task stays in flight; recovery picks it up after a takeover.
        Err(e) => error!(error = %e, "failed to record task result"),
    }
    shared.cancelled.lock().await.remove(&key);
}

/// Run one attempt, retrying retryable errors in place.
async fn execute_with_retry(
    worker: usize,
    config: &WorkerPoolConfig,
    executor: &dyn TaskExecutor,
    task: &ExecutableTask,
    attempt: u32,
) -> TaskExecutionResult {
    let mut tries = 0u32;

    loop {
        tries += 1;
        let ctx = ExecutionContext {
            attempt,
            try_number: tries,
            worker,
        };

        match executor.execute(task, &ctx).await {
            Ok(result) => return result,

            Err(WorkerError::Fatal(msg)) => {
                warn!(error = %msg, "fatal worker error");
                return TaskExecutionResult::failed(msg);
            }

            Err(WorkerError::Retryable(msg)) => {
                if tries > config.max_retries {
                    warn!(tries, error = %msg, "retries exhausted");
                    return TaskExecutionResult::failed(format!("retries exhausted: {msg}"));
                }

                let delay = config
                    .retry_base_delay
                    .saturating_mul(2u32.saturating_pow(tries - 1));
                warn!(
                    tries,
                    max_retries = config.max_retries,
                    ?delay,
                    error = %msg,
                    "retryable worker error; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
