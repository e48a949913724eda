//! Scheduler tests against the in-memory store.
//!
//! Workers are simulated: a recording dispatcher captures what would have
//! been executed and tests write results into the store themselves, the
//! way a worker would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use db::{ChangeEvent, CoordinationStore, DbError, Expect, Fence, MemoryStore, Versioned};
use tokio::sync::{broadcast, Mutex};

use crate::models::DELAY_MS_PARAMETER;
use crate::*;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingDispatcher {
    dispatched: Mutex<Vec<(TaskId, u32)>>,
    cancelled: Mutex<Vec<TaskId>>,
    refuse: HashSet<TaskId>,
}

impl RecordingDispatcher {
    fn refusing(ids: &[&str]) -> Self {
        Self {
            refuse: ids.iter().map(|id| TaskId::from(*id)).collect(),
            ..Self::default()
        }
    }

    async fn take(&self) -> Vec<(TaskId, u32)> {
        std::mem::take(&mut *self.dispatched.lock().await)
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, task: ExecutableTask, attempt: u32) -> Result<(), EngineError> {
        if self.refuse.contains(&task.task_id) {
            return Err(EngineError::Dispatch {
                task_id: task.task_id,
                message: "no worker for this task".into(),
            });
        }
        self.dispatched.lock().await.push((task.task_id, attempt));
        Ok(())
    }

    async fn cancel(&self, _run_id: &RunId, task_id: &TaskId) {
        self.cancelled.lock().await.push(task_id.clone());
    }
}

/// Counts prefix listings, the reads a full restore is made of.
struct CountingStore {
    inner: Arc<MemoryStore>,
    lists: AtomicUsize,
}

impl CountingStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            lists: AtomicUsize::new(0),
        }
    }

    fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationStore for CountingStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, DbError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, DbError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list(prefix).await
    }

    async fn put(&self, key: &str, value: String, expect: Expect, fence: Option<&Fence>) -> Result<u64, DbError> {
        self.inner.put(key, value, expect, fence).await
    }

    async fn delete(&self, key: &str, fence: Option<&Fence>) -> Result<(), DbError> {
        self.inner.delete(key, fence).await
    }

    async fn acquire_lock(&self, lock: &str, owner: &str, ttl: Duration) -> Result<Option<Fence>, DbError> {
        self.inner.acquire_lock(lock, owner, ttl).await
    }

    async fn renew_lock(&self, fence: &Fence, ttl: Duration) -> Result<Fence, DbError> {
        self.inner.renew_lock(fence, ttl).await
    }

    async fn release_lock(&self, fence: &Fence) -> Result<(), DbError> {
        self.inner.release_lock(fence).await
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.watch()
    }
}

fn config(instance: &str) -> SchedulerConfig {
    SchedulerConfig {
        instance_id: instance.into(),
        lock_ttl: Duration::from_secs(5),
        poll_interval: Duration::from_millis(100),
        purge_completed_runs: false,
    }
}

fn scheduler_on(
    store: &Arc<MemoryStore>,
    dispatcher: &Arc<RecordingDispatcher>,
    instance: &str,
) -> WorkflowScheduler {
    WorkflowScheduler::new(RunStore::new(store.clone()), dispatcher.clone(), config(instance))
}

fn job(id: &str, idempotent: bool, children: Vec<Arc<Task>>) -> Arc<Task> {
    let task_type = TaskType::new("job", "1", idempotent).unwrap();
    Arc::new(Task::new(id.into(), Some(task_type), children, HashMap::new()))
}

/// R (grouping) → {A, B}; A → {C}. B is not idempotent.
fn scenario() -> Task {
    let c = job("C", true, vec![]);
    let a = job("A", true, vec![c]);
    let b = job("B", false, vec![]);
    Task::group("R".into(), vec![a, b])
}

fn stop(message: &str) -> TaskExecutionResult {
    TaskExecutionResult::new(TaskExecutionStatus::FailedStop, message, HashMap::new())
}

fn ids(dispatched: &[(TaskId, u32)]) -> Vec<&str> {
    let mut ids: Vec<&str> = dispatched.iter().map(|(id, _)| id.as_str()).collect();
    ids.sort();
    ids
}

async fn deliver(store: &RunStore, run_id: &RunId, task: &str, result: TaskExecutionResult) -> bool {
    store.complete_task(run_id, &task.into(), &result, None).await.unwrap()
}

fn progressed(advance: Advance) -> RunProgress {
    match advance {
        Advance::Progressed(progress) => progress,
        Advance::Busy => panic!("run lease unexpectedly held"),
    }
}

// ============================================================
// Submission
// ============================================================

#[tokio::test]
async fn duplicate_run_id_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");

    let params = RunParameters::default();
    scheduler.submit_with_id("run".into(), &scenario(), &params).await.unwrap();
    assert!(matches!(
        scheduler.submit_with_id("run".into(), &scenario(), &params).await,
        Err(EngineError::DuplicateRun(_))
    ));
}

#[tokio::test]
async fn invalid_graph_persists_nothing() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");

    let leaf_b = Arc::new(Task::leaf("b".into(), TaskType::new("job", "1", true).unwrap()));
    let inner_a = job("a", true, vec![leaf_b]);
    let cyclic = job("a", true, vec![job("b", true, vec![inner_a])]);

    assert!(matches!(
        scheduler.submit(&cyclic, &RunParameters::default()).await,
        Err(EngineError::InvalidGraph(_))
    ));
    assert!(store.is_empty().await);
}

// ============================================================
// Readiness and completion
// ============================================================

#[tokio::test]
async fn scenario_runs_to_partial_failure() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();

    // The grouping root completes without dispatch and releases A and B.
    let first = progressed(scheduler.advance_run(&run_id).await.unwrap());
    assert_eq!(ids(&dispatcher.take().await), vec!["A", "B"]);
    assert!(first.finished.is_none());

    // B's failure does not affect C, which waits only for A.
    deliver(scheduler.store(), &run_id, "B", TaskExecutionResult::failed("boom")).await;
    scheduler.advance_run(&run_id).await.unwrap();
    assert!(dispatcher.take().await.is_empty());

    deliver(scheduler.store(), &run_id, "A", TaskExecutionResult::success("a")).await;
    scheduler.advance_run(&run_id).await.unwrap();
    assert_eq!(ids(&dispatcher.take().await), vec!["C"]);

    deliver(scheduler.store(), &run_id, "C", TaskExecutionResult::success("c")).await;
    let last = progressed(scheduler.advance_run(&run_id).await.unwrap());
    let report = last.finished.expect("run should be finished");

    assert_eq!(report.outcome, RunOutcome::PartiallyFailed);
    assert_eq!(report.failed, vec![TaskId::from("B")]);
    assert_eq!(report.completed.len(), 3);
    assert!(report.completion_time_utc.unwrap() >= report.start_time_utc);

    let (runnable, _) = scheduler.store().load_run(&run_id).await.unwrap();
    assert!(runnable.is_complete());
}

#[tokio::test]
async fn failure_leaves_dependents_unreachable() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();

    scheduler.advance_run(&run_id).await.unwrap();
    deliver(scheduler.store(), &run_id, "A", TaskExecutionResult::failed("boom")).await;
    deliver(scheduler.store(), &run_id, "B", TaskExecutionResult::success("b")).await;
    let report = progressed(scheduler.advance_run(&run_id).await.unwrap())
        .finished
        .unwrap();

    assert_eq!(report.unreachable, vec![TaskId::from("C")]);
    assert!(matches!(
        report.into_result(),
        Err(EngineError::WorkerFailure { failed, .. }) if failed == vec![TaskId::from("A"), TaskId::from("C")]
    ));
}

#[tokio::test]
async fn duplicate_result_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_run(&run_id).await.unwrap();

    assert!(deliver(scheduler.store(), &run_id, "A", TaskExecutionResult::success("first")).await);
    assert!(!deliver(scheduler.store(), &run_id, "A", TaskExecutionResult::failed("again")).await);

    let states = scheduler.status(&run_id).await.unwrap();
    assert_eq!(states[&TaskId::from("A")], TaskState::Completed);
}

#[tokio::test]
async fn refused_dispatch_fails_the_task() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::refusing(&["A"]));
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();

    scheduler.advance_run(&run_id).await.unwrap();
    let states = scheduler.status(&run_id).await.unwrap();
    assert_eq!(states[&TaskId::from("A")], TaskState::Failed);
    assert_eq!(states[&TaskId::from("C")], TaskState::Unreachable);
    assert_eq!(states[&TaskId::from("B")], TaskState::Started);
}

#[tokio::test]
async fn failed_stop_cancels_in_flight_and_pending_tasks() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_run(&run_id).await.unwrap();
    dispatcher.take().await;

    deliver(scheduler.store(), &run_id, "A", stop("halt")).await;
    let report = progressed(scheduler.advance_run(&run_id).await.unwrap())
        .finished
        .expect("a stopped run finishes once its in-flight tasks are cancelled");

    assert!(dispatcher.take().await.is_empty());
    assert_eq!(*dispatcher.cancelled.lock().await, vec![TaskId::from("B")]);
    assert_eq!(report.outcome, RunOutcome::PartiallyFailed);
    assert_eq!(report.failed, vec![TaskId::from("A")]);
    assert_eq!(report.cancelled, vec![TaskId::from("B"), TaskId::from("C")]);
    assert!(report.unreachable.is_empty());

    // B's worker finishing later changes nothing.
    assert!(!deliver(scheduler.store(), &run_id, "B", TaskExecutionResult::success("b")).await);
    assert_eq!(scheduler.report(&run_id).await.unwrap(), report);
}

#[tokio::test]
async fn result_recorded_before_the_stop_is_kept() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_run(&run_id).await.unwrap();

    deliver(scheduler.store(), &run_id, "B", TaskExecutionResult::success("b")).await;
    deliver(scheduler.store(), &run_id, "A", stop("halt")).await;
    let report = progressed(scheduler.advance_run(&run_id).await.unwrap())
        .finished
        .unwrap();

    assert!(dispatcher.cancelled.lock().await.is_empty());
    assert_eq!(report.completed, vec![TaskId::from("B"), TaskId::from("R")]);
    assert_eq!(report.cancelled, vec![TaskId::from("C")]);
}

/// R (grouping) → {S, X}; X → {Y}.
fn stop_scenario() -> Task {
    let y = job("Y", true, vec![]);
    let x = job("X", true, vec![y]);
    Task::group("R".into(), vec![job("S", true, vec![]), x])
}

#[tokio::test]
async fn held_stop_reports_what_a_restore_reports() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&stop_scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_held(&run_id, None).await.unwrap();
    assert_eq!(ids(&dispatcher.take().await), vec!["S", "X"]);

    deliver(scheduler.store(), &run_id, "S", stop("halt")).await;
    let live = progressed(scheduler.advance_held(&run_id, Some(&"S".into())).await.unwrap())
        .finished
        .unwrap();

    assert_eq!(live.cancelled, vec![TaskId::from("X"), TaskId::from("Y")]);
    assert!(live.unreachable.is_empty());
    assert_eq!(scheduler.report(&run_id).await.unwrap(), live);

    let states = scheduler.status(&run_id).await.unwrap();
    assert_eq!(states[&TaskId::from("Y")], TaskState::Cancelled);
}

// ============================================================
// Locking
// ============================================================

#[tokio::test]
async fn run_held_by_another_scheduler_is_busy() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();

    let other = RunStore::new(store.clone());
    let _held = other
        .lock_run(&run_id, "s2", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(scheduler.advance_run(&run_id).await.unwrap(), Advance::Busy);
    assert!(dispatcher.take().await.is_empty());
}

#[tokio::test]
async fn held_run_applies_results_without_rereading_the_run() {
    let memory = Arc::new(MemoryStore::new());
    let counting = Arc::new(CountingStore::new(memory.clone()));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = WorkflowScheduler::new(RunStore::new(counting.clone()), dispatcher.clone(), config("s1"));
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();

    scheduler.advance_held(&run_id, None).await.unwrap();
    assert_eq!(ids(&dispatcher.take().await), vec!["A", "B"]);
    let lists = counting.lists();

    // The lease stays with the first scheduler between passes.
    let other = scheduler_on(&memory, &dispatcher, "s2");
    assert_eq!(other.advance_run(&run_id).await.unwrap(), Advance::Busy);

    deliver(scheduler.store(), &run_id, "A", TaskExecutionResult::success("a")).await;
    scheduler.advance_held(&run_id, Some(&"A".into())).await.unwrap();
    assert_eq!(ids(&dispatcher.take().await), vec!["C"]);

    deliver(scheduler.store(), &run_id, "B", TaskExecutionResult::success("b")).await;
    scheduler.advance_held(&run_id, Some(&"B".into())).await.unwrap();
    deliver(scheduler.store(), &run_id, "C", TaskExecutionResult::success("c")).await;
    let report = progressed(scheduler.advance_held(&run_id, Some(&"C".into())).await.unwrap())
        .finished
        .unwrap();

    assert!(report.is_success());
    assert_eq!(counting.lists(), lists);

    // A finished run gives its lease back.
    assert!(matches!(other.advance_run(&run_id).await.unwrap(), Advance::Progressed(_)));
}

#[tokio::test]
async fn operator_action_reuses_the_held_lease() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_held(&run_id, None).await.unwrap();

    let report = scheduler.cancel_run(&run_id).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);

    let other = scheduler_on(&store, &dispatcher, "s2");
    assert!(matches!(other.advance_run(&run_id).await.unwrap(), Advance::Progressed(_)));
}

#[tokio::test(start_paused = true)]
async fn lapsed_held_lease_is_not_reused() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_held(&run_id, None).await.unwrap();
    dispatcher.take().await;

    tokio::time::advance(Duration::from_secs(6)).await;
    let successor = RunStore::new(store.clone());
    let _taken = successor
        .lock_run(&run_id, "s2", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    deliver(scheduler.store(), &run_id, "A", TaskExecutionResult::success("a")).await;
    assert_eq!(
        scheduler.advance_held(&run_id, Some(&"A".into())).await.unwrap(),
        Advance::Busy
    );
    assert!(dispatcher.take().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn expired_lease_of_dead_scheduler_is_reclaimed() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();

    let dead = RunStore::new(store.clone());
    dead.lock_run(&run_id, "dead", Duration::from_secs(1)).await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(matches!(scheduler.advance_run(&run_id).await.unwrap(), Advance::Progressed(_)));
    assert_eq!(ids(&dispatcher.take().await), vec!["A", "B"]);
}

// ============================================================
// Recovery
// ============================================================

#[tokio::test]
async fn takeover_redispatches_only_idempotent_tasks() {
    let store = Arc::new(MemoryStore::new());
    let crashed = Arc::new(RecordingDispatcher::default());
    let run_id = scheduler_on(&store, &crashed, "old")
        .submit(&scenario(), &RunParameters::default())
        .await
        .unwrap();
    scheduler_on(&store, &crashed, "old").advance_run(&run_id).await.unwrap();
    assert_eq!(ids(&crashed.take().await), vec!["A", "B"]);

    // A new scheduler takes over with both tasks still in flight.
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let successor = scheduler_on(&store, &dispatcher, "new");
    let recovered = successor.recover_all().await.unwrap();

    assert_eq!(recovered.len(), 1);
    let progress = &recovered[0].1;
    assert_eq!(progress.redispatched, vec![TaskId::from("A")]);
    assert_eq!(progress.stalled, vec![TaskId::from("B")]);
    assert_eq!(dispatcher.take().await, vec![(TaskId::from("A"), 2)]);

    let started = successor.store().started_tasks(&run_id).await.unwrap();
    assert_eq!(started[&TaskId::from("A")].attempt, 2);
    assert_eq!(started[&TaskId::from("A")].data, "new#2");
    assert_eq!(started[&TaskId::from("B")].attempt, 1);
}

#[tokio::test]
async fn takeover_of_a_stopped_run_cancels_instead_of_redispatching() {
    let store = Arc::new(MemoryStore::new());
    let crashed = Arc::new(RecordingDispatcher::default());
    let old = scheduler_on(&store, &crashed, "old");
    let run_id = old.submit(&scenario(), &RunParameters::default()).await.unwrap();
    old.advance_run(&run_id).await.unwrap();
    deliver(old.store(), &run_id, "B", stop("halt")).await;

    let dispatcher = Arc::new(RecordingDispatcher::default());
    let recovered = scheduler_on(&store, &dispatcher, "new").recover_all().await.unwrap();

    let progress = &recovered[0].1;
    assert!(progress.redispatched.is_empty());
    assert!(progress.stalled.is_empty());
    assert!(dispatcher.take().await.is_empty());
    assert_eq!(*dispatcher.cancelled.lock().await, vec![TaskId::from("A")]);

    let report = progress.finished.as_ref().unwrap();
    assert_eq!(report.failed, vec![TaskId::from("B")]);
    assert_eq!(report.cancelled, vec![TaskId::from("A"), TaskId::from("C")]);
}

#[tokio::test]
async fn stalled_task_can_be_retried_manually() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_run(&run_id).await.unwrap();
    dispatcher.take().await;

    let attempt = scheduler.retry_task(&run_id, &"B".into()).await.unwrap();
    assert_eq!(attempt, 2);
    assert_eq!(dispatcher.take().await, vec![(TaskId::from("B"), 2)]);

    // Only in-flight tasks can be retried.
    assert!(matches!(
        scheduler.retry_task(&run_id, &"C".into()).await,
        Err(EngineError::InvalidTransition { from: TaskState::Pending, .. })
    ));
}

#[tokio::test]
async fn forced_result_unblocks_a_stalled_run() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_run(&run_id).await.unwrap();
    dispatcher.take().await;

    assert!(scheduler
        .force_result(&run_id, &"A".into(), TaskExecutionResult::success("by hand"))
        .await
        .unwrap());
    // Forcing advances the run: C is now dispatched.
    assert_eq!(ids(&dispatcher.take().await), vec!["C"]);

    // A second forced result for the same task changes nothing.
    assert!(!scheduler
        .force_result(&run_id, &"A".into(), TaskExecutionResult::failed("late"))
        .await
        .unwrap());

    assert!(matches!(
        scheduler
            .force_result(&run_id, &"missing".into(), TaskExecutionResult::failed("x"))
            .await,
        Err(EngineError::UnknownTask { .. })
    ));
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn cancelled_run_ignores_late_results() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");
    let run_id = scheduler.submit(&scenario(), &RunParameters::default()).await.unwrap();
    scheduler.advance_run(&run_id).await.unwrap();

    let report = scheduler.cancel_run(&run_id).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(
        report.cancelled,
        vec![TaskId::from("A"), TaskId::from("B"), TaskId::from("C")]
    );
    let mut signalled = dispatcher.cancelled.lock().await.clone();
    signalled.sort();
    assert_eq!(signalled, vec![TaskId::from("A"), TaskId::from("B")]);

    assert!(!deliver(scheduler.store(), &run_id, "A", TaskExecutionResult::success("late")).await);
    let again = progressed(scheduler.advance_run(&run_id).await.unwrap());
    assert_eq!(again.finished.unwrap().outcome, RunOutcome::Cancelled);
    assert_eq!(dispatcher.take().await.len(), 2);
}

// ============================================================
// Delays
// ============================================================

#[tokio::test(start_paused = true)]
async fn delayed_task_waits_without_blocking_siblings() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler_on(&store, &dispatcher, "s1");

    let mut metadata = HashMap::new();
    metadata.insert(DELAY_MS_PARAMETER.to_string(), "500".to_string());
    let delayed_type = TaskType::with_delay("timer", "1", true, true).unwrap();
    let delayed = Arc::new(Task::new("later".into(), Some(delayed_type), vec![], metadata));
    let root = Task::group("root".into(), vec![delayed, job("now", true, vec![])]);
    let run_id = scheduler.submit(&root, &RunParameters::default()).await.unwrap();

    let first = progressed(scheduler.advance_run(&run_id).await.unwrap());
    assert_eq!(first.deferred, vec![TaskId::from("later")]);
    assert!(first.next_wakeup.is_some());
    assert_eq!(ids(&dispatcher.take().await), vec!["now"]);

    tokio::time::advance(Duration::from_millis(200)).await;
    let early = progressed(scheduler.advance_run(&run_id).await.unwrap());
    assert_eq!(early.deferred, vec![TaskId::from("later")]);

    tokio::time::advance(Duration::from_millis(300)).await;
    let due = progressed(scheduler.advance_run(&run_id).await.unwrap());
    assert!(due.deferred.is_empty());
    assert_eq!(dispatcher.take().await, vec![(TaskId::from("later"), 1)]);
}

// ============================================================
// Archival
// ============================================================

#[tokio::test]
async fn finished_run_is_purged_when_configured() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let mut cfg = config("s1");
    cfg.purge_completed_runs = true;
    let scheduler = WorkflowScheduler::new(RunStore::new(store.clone()), dispatcher.clone(), cfg);

    let root = job("solo", true, vec![]);
    let run_id = scheduler.submit(&root, &RunParameters::default()).await.unwrap();
    scheduler.advance_run(&run_id).await.unwrap();
    deliver(scheduler.store(), &run_id, "solo", TaskExecutionResult::success("")).await;

    let report = progressed(scheduler.advance_run(&run_id).await.unwrap())
        .finished
        .unwrap();
    assert!(report.is_success());
    assert!(store.is_empty().await);
}
