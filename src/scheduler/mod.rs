//! Cron-driven archival and purge cycles.
//!
//! The scheduler owns one timer task per job type. Each tick loads the
//! enabled retention policies and asks the dispatcher to launch one unit per
//! policy; no data is moved in this process. At most one cycle per job type
//! is in flight at any time, whether it came from a timer or from
//! [`Scheduler::trigger_now`].

mod guard;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use self::guard::InFlightGuard;
use crate::{
    db::{DbError, DbPool},
    dispatch::WorkerDispatcher,
    models::{ExecutionOutcome, JobStats, JobType, RetentionPolicy},
    observability::metrics,
};

/// Error message written to an execution whose unit could not be started.
pub const LAUNCH_FAILED_MESSAGE: &str = "Failed to launch worker";

/// Error message written to executions reconciled as stale.
pub const STALE_EXECUTION_MESSAGE: &str = "Worker did not report completion";

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("A {0} cycle is already in flight")]
    AlreadyRunning(JobType),

    #[error("Failed to load enabled policies: {0}")]
    LoadPolicies(#[source] DbError),
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub job_type: JobType,
    /// Enabled policies found.
    pub policies: usize,
    /// Units started.
    pub launched: usize,
    /// Executions marked failed because their unit could not be started.
    pub launch_failures: usize,
    /// Stale `running` executions marked failed before dispatching.
    pub stale_reconciled: u64,
}

impl CycleSummary {
    fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            policies: 0,
            launched: 0,
            launch_failures: 0,
            stale_reconciled: 0,
        }
    }
}

#[derive(Default)]
struct CycleSlot {
    in_flight: AtomicBool,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

struct SchedulerState {
    db: Arc<DbPool>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    stale_after: Option<chrono::Duration>,
    archival: CycleSlot,
    purge: CycleSlot,
}

/// Owns the cycle timers and the per-job-type in-flight state.
///
/// Cloning is cheap and every clone shares the same state, so one clone can
/// be handed to a shutdown handler while another triggers manual cycles.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<SchedulerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    /// `stale_after_mins = 0` disables stale execution reconciliation.
    pub fn new(
        db: Arc<DbPool>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        stale_after_mins: u64,
    ) -> Self {
        let stale_after = i64::try_from(stale_after_mins)
            .ok()
            .filter(|minutes| *minutes > 0)
            .and_then(chrono::Duration::try_minutes);

        Self {
            state: Arc::new(SchedulerState {
                db,
                dispatcher,
                stale_after,
                archival: CycleSlot::default(),
                purge: CycleSlot::default(),
            }),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Start one timer per job type. Call once per scheduler.
    pub fn start(&self, archival: Schedule, purge: Schedule) {
        for (job_type, schedule) in [(JobType::Archival, archival), (JobType::Purge, purge)] {
            let scheduler = self.clone();
            self.tracker
                .spawn(async move { scheduler.timer_loop(job_type, schedule).await });
        }
        tracing::info!(
            dispatcher = self.state.dispatcher.name(),
            stale_reconciliation = self.state.stale_after.is_some(),
            "Scheduler started"
        );
    }

    /// Cancel both timers and wait for ticks already in progress to finish
    /// launching. Units that were already started keep running.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Scheduler stopped");
    }

    /// Run one cycle now, subject to the same overlap guard as timer ticks.
    pub async fn trigger_now(&self, job_type: JobType) -> Result<CycleSummary, CycleError> {
        self.state.run_cycle(job_type).await
    }

    /// When the last cycle of `job_type` started, if any.
    pub fn last_tick(&self, job_type: JobType) -> Option<DateTime<Utc>> {
        *self.state.slot(job_type).last_tick.lock()
    }

    pub fn is_in_flight(&self, job_type: JobType) -> bool {
        self.state.slot(job_type).in_flight.load(Ordering::Acquire)
    }

    async fn timer_loop(self, job_type: JobType, schedule: Schedule) {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::warn!(job_type = %job_type, "Schedule has no upcoming fire times, timer stopped");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(job_type = %job_type, next = %next, "Next cycle scheduled");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let state = Arc::clone(&self.state);
            self.tracker.spawn(async move {
                // Outcomes are logged and counted inside the cycle.
                let _ = state.run_cycle(job_type).await;
            });
        }
        tracing::debug!(job_type = %job_type, "Timer stopped");
    }
}

impl SchedulerState {
    fn slot(&self, job_type: JobType) -> &CycleSlot {
        match job_type {
            JobType::Archival => &self.archival,
            JobType::Purge => &self.purge,
        }
    }

    async fn run_cycle(&self, job_type: JobType) -> Result<CycleSummary, CycleError> {
        let slot = self.slot(job_type);
        let Some(_guard) = InFlightGuard::try_acquire(&slot.in_flight) else {
            tracing::info!(job_type = %job_type, "Previous cycle still in flight, skipping");
            metrics::record_cycle(job_type.as_str(), "skipped", 0.0);
            return Err(CycleError::AlreadyRunning(job_type));
        };

        *slot.last_tick.lock() = Some(Utc::now());
        let started = Instant::now();
        let result = self.launch_all(job_type).await;
        let duration = started.elapsed().as_secs_f64();

        match &result {
            Ok(summary) => {
                tracing::info!(
                    job_type = %job_type,
                    policies = summary.policies,
                    launched = summary.launched,
                    launch_failures = summary.launch_failures,
                    stale_reconciled = summary.stale_reconciled,
                    duration_secs = duration,
                    "Cycle completed"
                );
                metrics::record_cycle(job_type.as_str(), "completed", duration);
            }
            Err(e) => {
                tracing::error!(job_type = %job_type, error = %e, "Cycle aborted");
                metrics::record_cycle(job_type.as_str(), "failed", duration);
            }
        }
        result
    }

    async fn launch_all(&self, job_type: JobType) -> Result<CycleSummary, CycleError> {
        let mut summary = CycleSummary::new(job_type);

        if let Some(age) = self.stale_after {
            summary.stale_reconciled = self.reconcile_stale(job_type, age).await;
        }

        let policies = self
            .db
            .policies()
            .list_enabled()
            .await
            .map_err(CycleError::LoadPolicies)?;
        summary.policies = policies.len();
        metrics::set_enabled_policies(job_type.as_str(), policies.len());

        for policy in &policies {
            if self.launch_one(policy, job_type).await {
                summary.launched += 1;
            } else {
                summary.launch_failures += 1;
            }
        }

        Ok(summary)
    }

    /// Create the execution record and start its unit. Any failure is
    /// confined to this policy.
    async fn launch_one(&self, policy: &RetentionPolicy, job_type: JobType) -> bool {
        let executions = self.db.executions();

        let record = match executions.create(policy.id, job_type).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    policy_id = policy.id,
                    job_type = %job_type,
                    error = %e,
                    "Failed to create execution record"
                );
                metrics::record_launch(job_type.as_str(), false);
                return false;
            }
        };

        match self.dispatcher.launch(policy, job_type, record.id).await {
            Ok(handle) => {
                if let Err(e) = executions.set_worker_handle(record.id, handle.as_str()).await {
                    tracing::warn!(
                        execution_id = record.id,
                        handle = %handle,
                        error = %e,
                        "Failed to store worker handle"
                    );
                }
                metrics::record_launch(job_type.as_str(), true);
                true
            }
            Err(e) => {
                tracing::warn!(
                    policy_id = policy.id,
                    table = %policy.table_name,
                    job_type = %job_type,
                    execution_id = record.id,
                    error = %e,
                    "Failed to launch worker"
                );
                let outcome = ExecutionOutcome::failed(JobStats::default(), LAUNCH_FAILED_MESSAGE);
                if let Err(e) = executions.complete(record.id, &outcome).await {
                    tracing::error!(
                        execution_id = record.id,
                        error = %e,
                        "Failed to mark execution as failed"
                    );
                }
                metrics::record_launch(job_type.as_str(), false);
                false
            }
        }
    }

    async fn reconcile_stale(&self, job_type: JobType, age: chrono::Duration) -> u64 {
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match self
            .db
            .executions()
            .fail_stale(job_type, cutoff, STALE_EXECUTION_MESSAGE)
            .await
        {
            Ok(0) => 0,
            Ok(count) => {
                tracing::warn!(
                    job_type = %job_type,
                    count,
                    cutoff = %cutoff,
                    "Marked stale executions as failed"
                );
                metrics::record_stale_executions(job_type.as_str(), count);
                count
            }
            Err(e) => {
                tracing::error!(job_type = %job_type, error = %e, "Stale execution reconciliation failed");
                0
            }
        }
    }
}
