//! Scheduler tuning knobs.

use std::time::Duration;

/// Configuration for a [`WorkflowScheduler`](crate::WorkflowScheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identifies this scheduler as lock owner and in dispatch records.
    pub instance_id: String,
    /// Lease length for the leader lock and per-run locks.
    pub lock_ttl: Duration,
    /// Interval of the fallback tick: leadership renewal and a full sweep of
    /// unfinished runs in case a change notification was missed.
    pub poll_interval: Duration,
    /// Delete a run's keys once its completion time is durably recorded.
    pub purge_completed_runs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("scheduler-{}", uuid::Uuid::new_v4()),
            lock_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            purge_completed_runs: false,
        }
    }
}
