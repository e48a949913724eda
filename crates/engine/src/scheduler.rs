//! Workflow scheduler.
//!
//! `WorkflowScheduler` drives runs to completion:
//! 1. Submits runs (validate, materialize, persist).
//! 2. Under a per-run lease, restores the run state from the store, completes
//!    ready grouping nodes and dispatches ready executable tasks.
//! 3. Applies the recovery policy on leadership takeover.
//! 4. Finalizes finished runs and reports their outcome.
//!
//! Every write made while advancing a run carries the run lease's fencing
//! token. A write rejected by the store surfaces as
//! [`EngineError::StaleLockLost`]; the run is then left to whoever holds the
//! lease now.
//!
//! The leader loop keeps the lease of each unfinished run it advances,
//! together with the run state. Later passes renew the lease and apply the
//! one result that triggered them instead of re-reading the run. A lapsed
//! lease or a result the cached state cannot take falls back to a full
//! restore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{ChangeKind, Fence};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::dag::TaskGraph;
use crate::dispatch::TaskDispatcher;
use crate::materialize::{self, RunParameters};
use crate::models::{ExecutableTask, RunId, StartedTask, Task, TaskExecutionResult, TaskId};
use crate::recovery::RecoveryPlan;
use crate::report::RunReport;
use crate::run_state::{RunState, TaskState};
use crate::store::{RunStore, RUNS_PREFIX};
use crate::EngineError;

/// Pause between attempts to take a run lease held by someone else.
const LOCK_RETRY: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What one pass over a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunProgress {
    /// Tasks handed to the dispatcher for their first attempt.
    pub dispatched: Vec<TaskId>,
    /// In-flight idempotent tasks dispatched again during recovery.
    pub redispatched: Vec<TaskId>,
    /// In-flight non-idempotent tasks held for manual intervention.
    pub stalled: Vec<TaskId>,
    /// Ready tasks waiting for their declared delay.
    pub deferred: Vec<TaskId>,
    /// Started records that match no task of the run.
    pub ambiguous: Vec<TaskId>,
    /// Earliest instant a deferred task becomes due.
    pub next_wakeup: Option<Instant>,
    /// Set once the run is finalized.
    pub finished: Option<RunReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Another scheduler holds the run lease.
    Busy,
    Progressed(RunProgress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Advance,
    Recover,
}

/// A run lease kept between passes, with the state it protects.
struct HeldRun {
    fence: Fence,
    state: RunState,
    version: u64,
}

#[derive(Debug, Clone, Copy)]
struct DelayState {
    ready_at: Instant,
    wakeup_armed: bool,
}

// ---------------------------------------------------------------------------
// WorkflowScheduler
// ---------------------------------------------------------------------------

pub struct WorkflowScheduler {
    store: RunStore,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: SchedulerConfig,
    delays: Mutex<HashMap<(RunId, TaskId), DelayState>>,
    held: Mutex<HashMap<RunId, HeldRun>>,
    wakeup_tx: mpsc::UnboundedSender<RunId>,
    wakeup_rx: Mutex<Option<mpsc::UnboundedReceiver<RunId>>>,
}

impl WorkflowScheduler {
    pub fn new(store: RunStore, dispatcher: Arc<dyn TaskDispatcher>, config: SchedulerConfig) -> Self {
        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();
        Self {
            store,
            dispatcher,
            config,
            delays: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            wakeup_tx,
            wakeup_rx: Mutex::new(Some(wakeup_rx)),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Materialize `root` under a fresh run id and persist it.
    pub async fn submit(&self, root: &Task, parameters: &RunParameters) -> Result<RunId, EngineError> {
        let run_id = RunId::random();
        self.submit_with_id(run_id.clone(), root, parameters).await?;
        Ok(run_id)
    }

    /// # Errors
    /// [`EngineError::InvalidGraph`] before anything is written, or
    /// [`EngineError::DuplicateRun`] if `run_id` is taken.
    #[instrument(skip_all, fields(run_id = %run_id, root = %root.id()))]
    pub async fn submit_with_id(
        &self,
        run_id: RunId,
        root: &Task,
        parameters: &RunParameters,
    ) -> Result<(), EngineError> {
        let graph = TaskGraph::build(root)?;
        let tasks = graph.topological_order().len();
        let runnable = materialize::from_graph(&run_id, graph, parameters, Utc::now());
        self.store.create_run(&run_id, &runnable).await?;

        info!(tasks, "run submitted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Advancing runs
    // -----------------------------------------------------------------------

    /// Dispatch whatever is ready in `run_id` and finalize it if finished.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn advance_run(&self, run_id: &RunId) -> Result<Advance, EngineError> {
        self.drive(run_id, Mode::Advance, false, None).await
    }

    /// Like [`advance_run`](Self::advance_run), first applying the recovery
    /// policy to tasks left in flight by a previous scheduler.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn recover_run(&self, run_id: &RunId) -> Result<Advance, EngineError> {
        self.drive(run_id, Mode::Recover, false, None).await
    }

    /// Advance a run and keep its lease and state for the next pass.
    ///
    /// `result` names the task whose result triggered the pass; only that
    /// result is read when the run is already held.
    pub(crate) async fn advance_held(&self, run_id: &RunId, result: Option<&TaskId>) -> Result<Advance, EngineError> {
        self.drive(run_id, Mode::Advance, true, result).await
    }

    /// Recover every unfinished run. Per-run errors are logged and skipped.
    #[instrument(skip_all)]
    pub async fn recover_all(&self) -> Result<Vec<(RunId, RunProgress)>, EngineError> {
        let runs = self.store.unfinished_runs().await?;
        info!(runs = runs.len(), "recovering unfinished runs");

        let mut recovered = Vec::new();
        for run_id in runs {
            match self.recover_run(&run_id).await {
                Ok(Advance::Progressed(progress)) => recovered.push((run_id, progress)),
                Ok(Advance::Busy) => debug!(run_id = %run_id, "run lease held elsewhere; skipping"),
                Err(e) => self.log_run_error(&run_id, &e),
            }
        }
        Ok(recovered)
    }

    async fn drive(
        &self,
        run_id: &RunId,
        mode: Mode,
        retain: bool,
        result: Option<&TaskId>,
    ) -> Result<Advance, EngineError> {
        let Some(mut held) = self.hold(run_id, result).await? else {
            return Ok(Advance::Busy);
        };

        let outcome = self.advance_locked(&mut held.state, held.version, &held.fence, mode).await;
        match outcome {
            Ok(progress) if retain && progress.finished.is_none() => {
                self.held.lock().await.insert(run_id.clone(), held);
                Ok(Advance::Progressed(progress))
            }
            outcome => {
                self.store.release(&held.fence).await;
                outcome.map(Advance::Progressed)
            }
        }
    }

    /// Lease and state for one pass: the held ones when the lease is still
    /// ours, otherwise a fresh lease and a full restore. `None` when another
    /// scheduler holds the run.
    async fn hold(&self, run_id: &RunId, result: Option<&TaskId>) -> Result<Option<HeldRun>, EngineError> {
        if let Some(mut held) = self.take_held(run_id).await {
            let caught_up = self.catch_up(&mut held.state, result).await;
            match caught_up {
                Ok(()) => return Ok(Some(held)),
                Err(e) => {
                    debug!(run_id = %run_id, error = %e, "held run state is stale; restoring");
                    return self.restore_under(run_id, held.fence).await.map(Some);
                }
            }
        }

        match self
            .store
            .lock_run(run_id, &self.config.instance_id, self.config.lock_ttl)
            .await?
        {
            Some(fence) => self.restore_under(run_id, fence).await.map(Some),
            None => Ok(None),
        }
    }

    async fn restore_under(&self, run_id: &RunId, fence: Fence) -> Result<HeldRun, EngineError> {
        match self.store.restore(run_id).await {
            Ok((state, version)) => Ok(HeldRun { fence, state, version }),
            Err(e) => {
                self.store.release(&fence).await;
                Err(e)
            }
        }
    }

    /// Remove a held run and renew its lease. A lapsed lease is dropped.
    async fn take_held(&self, run_id: &RunId) -> Option<HeldRun> {
        let held = self.held.lock().await.remove(run_id)?;
        match self.store.renew(&held.fence, self.config.lock_ttl).await {
            Ok(fence) => Some(HeldRun { fence, ..held }),
            Err(e) => {
                debug!(run_id = %run_id, error = %e, "held run lease lapsed");
                None
            }
        }
    }

    /// Release every held run lease.
    async fn release_held(&self) {
        let held: Vec<HeldRun> = self.held.lock().await.drain().map(|(_, held)| held).collect();
        for run in held {
            self.store.release(&run.fence).await;
        }
    }

    /// Apply the stored result of `task_id` to a held state.
    async fn catch_up(&self, state: &mut RunState, task_id: Option<&TaskId>) -> Result<(), EngineError> {
        let Some(task_id) = task_id else {
            return Ok(());
        };
        if let Some(result) = self.store.result(state.run_id(), task_id).await? {
            let transition = state.apply_result(task_id, &result)?;
            if transition.applied {
                debug!(
                    task_id = %task_id,
                    status = ?result.status,
                    newly_ready = transition.newly_ready.len(),
                    unreachable = transition.unreachable.len(),
                    cancelled = transition.cancelled.len(),
                    "applied result"
                );
            }
        }
        Ok(())
    }

    async fn advance_locked(
        &self,
        state: &mut RunState,
        version: u64,
        fence: &Fence,
        mode: Mode,
    ) -> Result<RunProgress, EngineError> {
        let run_id = state.run_id().clone();
        let mut progress = RunProgress::default();

        if state.runnable().is_complete() {
            progress.finished = Some(RunReport::from_state(state));
            return Ok(progress);
        }

        if state.is_stopped() {
            self.cancel_in_flight(state, fence).await?;
        }

        if mode == Mode::Recover {
            let plan = RecoveryPlan::for_run(state);
            if !plan.is_empty() {
                info!(
                    redispatch = plan.redispatch.len(),
                    stalled = plan.stalled.len(),
                    ambiguous = plan.ambiguous.len(),
                    "recovering in-flight tasks"
                );
            }
            if let Err(e) = plan.check_ambiguous(&run_id) {
                warn!(error = %e, "leaving orphaned started records for an operator");
            }

            for (task_id, attempt) in &plan.redispatch {
                info!(task_id = %task_id, attempt, "re-dispatching idempotent task after takeover");
                self.redispatch(state, task_id, *attempt, fence).await?;
            }
            for task_id in &plan.stalled {
                warn!(task_id = %task_id, "non-idempotent task was in flight; holding for manual retry");
            }

            progress.redispatched = plan.redispatch.into_iter().map(|(id, _)| id).collect();
            progress.stalled = plan.stalled;
            progress.ambiguous = plan.ambiguous;
        }

        self.complete_grouping_nodes(state, fence).await?;
        self.dispatch_ready(state, fence, &mut progress).await?;

        if state.is_finished() {
            progress.finished = Some(self.finalize(state, version, fence).await?);
        }
        Ok(progress)
    }

    /// After a stop, every in-flight task gets a `Cancelled` result and its
    /// worker is signalled. A result that was recorded first is applied
    /// instead.
    async fn cancel_in_flight(&self, state: &mut RunState, fence: &Fence) -> Result<(), EngineError> {
        let run_id = state.run_id().clone();
        let in_flight: Vec<TaskId> = state.in_flight().into_iter().cloned().collect();

        for task_id in in_flight {
            let cancelled = TaskExecutionResult::cancelled();
            if self.store.complete_task(&run_id, &task_id, &cancelled, Some(fence)).await? {
                state.apply_result(&task_id, &cancelled)?;
                self.dispatcher.cancel(&run_id, &task_id).await;
                info!(task_id = %task_id, "cancelled in-flight task of a stopped run");
            } else if let Some(result) = self.store.result(&run_id, &task_id).await? {
                state.apply_result(&task_id, &result)?;
            }
        }
        Ok(())
    }

    /// Grouping nodes complete as soon as they are ready, which may release
    /// further grouping nodes.
    async fn complete_grouping_nodes(&self, state: &mut RunState, fence: &Fence) -> Result<(), EngineError> {
        let run_id = state.run_id().clone();
        loop {
            let grouping: Vec<TaskId> = state
                .ready_tasks()
                .iter()
                .filter(|t| !t.is_executable)
                .map(|t| t.task_id.clone())
                .collect();
            if grouping.is_empty() {
                return Ok(());
            }

            for task_id in grouping {
                self.store
                    .complete_task(&run_id, &task_id, &TaskExecutionResult::success(""), Some(fence))
                    .await?;
                state.complete_grouping(&task_id)?;
                debug!(task_id = %task_id, "grouping node completed");
            }
        }
    }

    async fn dispatch_ready(
        &self,
        state: &mut RunState,
        fence: &Fence,
        progress: &mut RunProgress,
    ) -> Result<(), EngineError> {
        let run_id = state.run_id().clone();
        let now = Instant::now();
        let ready: Vec<ExecutableTask> = state.ready_tasks().into_iter().cloned().collect();

        for task in ready {
            if let Some(delay) = task.delay() {
                let due = self.ready_at(&run_id, &task.task_id, now).await + delay;
                if due > now {
                    self.arm_wakeup(&run_id, &task.task_id, due).await;
                    debug!(task_id = %task.task_id, ?delay, "deferring delayed task");
                    progress.next_wakeup = Some(progress.next_wakeup.map_or(due, |w| w.min(due)));
                    progress.deferred.push(task.task_id);
                    continue;
                }
                self.delays.lock().await.remove(&(run_id.clone(), task.task_id.clone()));
            }

            let task_id = task.task_id.clone();
            let record = StartedTask::new(&self.config.instance_id, 1, Utc::now());
            self.store.start_task(&run_id, &task_id, &record, fence).await?;
            state.mark_started(&task_id, record)?;
            self.hand_off(state, task, 1, fence).await?;
            progress.dispatched.push(task_id);
        }
        Ok(())
    }

    /// Write a new attempt for an in-flight task and dispatch it.
    async fn redispatch(
        &self,
        state: &mut RunState,
        task_id: &TaskId,
        attempt: u32,
        fence: &Fence,
    ) -> Result<(), EngineError> {
        let run_id = state.run_id().clone();
        let task = state.task(task_id).cloned().ok_or_else(|| EngineError::UnknownTask {
            run_id: run_id.clone(),
            task_id: task_id.clone(),
        })?;

        let record = StartedTask::new(&self.config.instance_id, attempt, Utc::now());
        self.store.start_task(&run_id, task_id, &record, fence).await?;
        state.record_attempt(task_id, record)?;
        self.hand_off(state, task, attempt, fence).await
    }

    /// A refused dispatch is recorded as a task failure.
    async fn hand_off(
        &self,
        state: &mut RunState,
        task: ExecutableTask,
        attempt: u32,
        fence: &Fence,
    ) -> Result<(), EngineError> {
        let run_id = task.run_id.clone();
        let task_id = task.task_id.clone();
        debug!(task_id = %task_id, attempt, "dispatching task");

        if let Err(e) = self.dispatcher.dispatch(task, attempt).await {
            warn!(task_id = %task_id, attempt, error = %e, "dispatch refused; failing task");
            let result = TaskExecutionResult::failed(e.to_string());
            if self.store.complete_task(&run_id, &task_id, &result, Some(fence)).await? {
                let transition = state.apply_result(&task_id, &result)?;
                if !transition.unreachable.is_empty() {
                    debug!(task_id = %task_id, unreachable = ?transition.unreachable, "dependents unreachable");
                }
            }
        }
        Ok(())
    }

    async fn finalize(&self, state: &mut RunState, version: u64, fence: &Fence) -> Result<RunReport, EngineError> {
        let run_id = state.run_id().clone();
        state.runnable_mut().mark_complete(Utc::now());
        self.store.update_run(&run_id, state.runnable(), version, fence).await?;

        let report = RunReport::from_state(state);
        info!(
            run_id = %run_id,
            outcome = ?report.outcome,
            completed = report.completed.len(),
            failed = report.failed.len(),
            unreachable = report.unreachable.len(),
            cancelled = report.cancelled.len(),
            "run finished"
        );

        self.delays.lock().await.retain(|(run, _), _| run != &run_id);
        if self.config.purge_completed_runs {
            self.store.purge_run(&run_id, fence).await?;
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Delays
    // -----------------------------------------------------------------------

    /// When the task was first seen ready by this scheduler.
    async fn ready_at(&self, run_id: &RunId, task_id: &TaskId, now: Instant) -> Instant {
        self.delays
            .lock()
            .await
            .entry((run_id.clone(), task_id.clone()))
            .or_insert(DelayState {
                ready_at: now,
                wakeup_armed: false,
            })
            .ready_at
    }

    async fn arm_wakeup(&self, run_id: &RunId, task_id: &TaskId, due: Instant) {
        let mut delays = self.delays.lock().await;
        let Some(delay) = delays.get_mut(&(run_id.clone(), task_id.clone())) else {
            return;
        };
        if delay.wakeup_armed {
            return;
        }
        delay.wakeup_armed = true;

        let tx = self.wakeup_tx.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            // The loop may have stopped; nothing to wake then.
            let _ = tx.send(run_id);
        });
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Terminate every non-terminal task of a run and finalize it.
    ///
    /// In-flight workers are signalled best-effort; results they deliver
    /// afterwards are ignored.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<RunReport, EngineError> {
        let fence = self.lock_run_waiting(run_id).await?;
        let outcome = self.cancel_locked(run_id, &fence).await;
        self.store.release(&fence).await;
        outcome
    }

    async fn cancel_locked(&self, run_id: &RunId, fence: &Fence) -> Result<RunReport, EngineError> {
        let (mut state, _) = self.store.restore(run_id).await?;
        if state.runnable().is_complete() {
            return Ok(RunReport::from_state(&state));
        }

        let cancellation = state.cancel();
        for task_id in cancellation.pending.iter().chain(&cancellation.in_flight) {
            self.store
                .complete_task(run_id, task_id, &TaskExecutionResult::cancelled(), Some(fence))
                .await?;
        }
        for task_id in &cancellation.in_flight {
            self.dispatcher.cancel(run_id, task_id).await;
        }
        info!(
            pending = cancellation.pending.len(),
            in_flight = cancellation.in_flight.len(),
            "run cancelled"
        );

        // Re-read: a worker may have recorded its result first.
        let (mut state, version) = self.store.restore(run_id).await?;
        self.finalize(&mut state, version, fence).await
    }

    /// Dispatch a new attempt of an in-flight task, typically a stalled
    /// non-idempotent one after an operator checked it is safe.
    #[instrument(skip_all, fields(run_id = %run_id, task_id = %task_id))]
    pub async fn retry_task(&self, run_id: &RunId, task_id: &TaskId) -> Result<u32, EngineError> {
        let fence = self.lock_run_waiting(run_id).await?;
        let outcome = self.retry_locked(run_id, task_id, &fence).await;
        self.store.release(&fence).await;
        outcome
    }

    async fn retry_locked(&self, run_id: &RunId, task_id: &TaskId, fence: &Fence) -> Result<u32, EngineError> {
        let (mut state, _) = self.store.restore(run_id).await?;
        let from = state.state_of(task_id).ok_or_else(|| EngineError::UnknownTask {
            run_id: run_id.clone(),
            task_id: task_id.clone(),
        })?;
        if from != TaskState::Started {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.clone(),
                from,
                to: TaskState::Started,
            });
        }

        let attempt = state.started_record(task_id).map_or(1, |s| s.attempt).saturating_add(1);
        info!(attempt, "manual retry");
        self.redispatch(&mut state, task_id, attempt, fence).await?;
        Ok(attempt)
    }

    /// Record a terminal result for a task on an operator's behalf and
    /// advance the run.
    ///
    /// Returns `false` if the task already had a result.
    #[instrument(skip_all, fields(run_id = %run_id, task_id = %task_id, status = ?result.status))]
    pub async fn force_result(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        result: TaskExecutionResult,
    ) -> Result<bool, EngineError> {
        let fence = self.lock_run_waiting(run_id).await?;
        let outcome = self.force_locked(run_id, task_id, &result, &fence).await;
        self.store.release(&fence).await;
        outcome
    }

    async fn force_locked(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        result: &TaskExecutionResult,
        fence: &Fence,
    ) -> Result<bool, EngineError> {
        let (mut state, version) = self.store.restore(run_id).await?;

        // Check the transition before anything is written.
        let mut checked = state.clone();
        if !checked.apply_result(task_id, result)?.applied {
            return Ok(false);
        }

        let written = self.store.complete_task(run_id, task_id, result, Some(fence)).await?;
        if written {
            warn!("result forced by operator");
            state.apply_result(task_id, result)?;
            self.advance_locked(&mut state, version, fence, Mode::Advance).await?;
        }
        Ok(written)
    }

    /// Take the run lease, waiting at most one lease period for a holder to
    /// release it or let it expire. A lease this scheduler holds is reused.
    async fn lock_run_waiting(&self, run_id: &RunId) -> Result<Fence, EngineError> {
        let deadline = Instant::now() + self.config.lock_ttl;
        loop {
            if let Some(held) = self.take_held(run_id).await {
                return Ok(held.fence);
            }
            if let Some(fence) = self
                .store
                .lock_run(run_id, &self.config.instance_id, self.config.lock_ttl)
                .await?
            {
                return Ok(fence);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::StaleLockLost(run_id.clone()));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Per-task states of a run. Takes no lock and writes nothing.
    pub async fn status(&self, run_id: &RunId) -> Result<HashMap<TaskId, TaskState>, EngineError> {
        let (state, _) = self.store.restore(run_id).await?;
        Ok(state.states().clone())
    }

    pub async fn report(&self, run_id: &RunId) -> Result<RunReport, EngineError> {
        let (state, _) = self.store.restore(run_id).await?;
        Ok(RunReport::from_state(&state))
    }

    // -----------------------------------------------------------------------
    // Leadership loop
    // -----------------------------------------------------------------------

    /// Schedule runs until `shutdown` flips to `true`.
    ///
    /// Only the leader advances runs. On takeover every unfinished run goes
    /// through recovery; after that the leader reacts to new runs and
    /// results, delay wake-ups, and a periodic sweep. Losing the leader
    /// lease sends the scheduler back to campaigning.
    #[instrument(skip_all, fields(instance = %self.config.instance_id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let mut wakeups = self
            .wakeup_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::InvalidArgument("scheduler loop is already running".into()))?;
        let mut events = self.store.coordination().watch();
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut leadership: Option<Fence> = None;

        while !*shutdown.borrow() {
            if leadership.is_none() {
                leadership = self.campaign().await;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                event = events.recv(), if leadership.is_some() => match event {
                    Ok(event) if event.kind == ChangeKind::Put => {
                        if let Some((run_id, task_id)) = RunStore::completed_task_of(&event.key) {
                            self.advance_logged(&run_id, Some(&task_id)).await;
                        } else if event.key.starts_with(RUNS_PREFIX) {
                            if let Some(run_id) = RunStore::run_of(&event.key) {
                                self.advance_logged(&run_id, None).await;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change notifications dropped; restoring and sweeping all runs");
                        self.release_held().await;
                        self.sweep().await;
                    }
                    Err(RecvError::Closed) => {
                        error!("store change stream closed");
                        break;
                    }
                },

                Some(run_id) = wakeups.recv(), if leadership.is_some() => {
                    self.advance_logged(&run_id, None).await;
                }

                _ = tick.tick() => {
                    if let Some(fence) = leadership.take() {
                        match self.store.renew(&fence, self.config.lock_ttl).await {
                            Ok(renewed) => {
                                leadership = Some(renewed);
                                self.sweep().await;
                            }
                            Err(e) => {
                                warn!(error = %e, "lost leadership");
                                self.release_held().await;
                            }
                        }
                    }
                }
            }
        }

        self.release_held().await;
        if let Some(fence) = leadership {
            self.store.release(&fence).await;
        }
        info!("scheduler stopped");
        Ok(())
    }

    async fn campaign(&self) -> Option<Fence> {
        match self
            .store
            .acquire_leadership(&self.config.instance_id, self.config.lock_ttl)
            .await
        {
            Ok(Some(fence)) => {
                info!(token = fence.token, "became leader");
                if let Err(e) = self.recover_all().await {
                    error!(error = %e, "recovery sweep failed");
                }
                Some(fence)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "leader election failed");
                None
            }
        }
    }

    async fn sweep(&self) {
        match self.store.unfinished_runs().await {
            Ok(runs) => {
                for run_id in runs {
                    self.advance_logged(&run_id, None).await;
                }
            }
            Err(e) => error!(error = %e, "failed to list unfinished runs"),
        }
    }

    async fn advance_logged(&self, run_id: &RunId, result: Option<&TaskId>) {
        match self.advance_held(run_id, result).await {
            Ok(Advance::Progressed(progress)) => {
                if let Some(report) = progress.finished {
                    debug!(run_id = %run_id, outcome = ?report.outcome, "run is finished");
                }
            }
            Ok(Advance::Busy) => debug!(run_id = %run_id, "run lease held elsewhere"),
            Err(e) => self.log_run_error(run_id, &e),
        }
    }

    fn log_run_error(&self, run_id: &RunId, err: &EngineError) {
        match err {
            EngineError::StaleLockLost(_) => {
                warn!(run_id = %run_id, "lost run lease; leaving the run to its new owner")
            }
            EngineError::UnknownRun(_) => debug!(run_id = %run_id, "run no longer exists"),
            other => error!(run_id = %run_id, error = %other, "failed to advance run"),
        }
    }
}
