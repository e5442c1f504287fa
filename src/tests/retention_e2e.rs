//! Full cycles against file-backed SQLite: a scheduler tick creates execution
//! records, the dispatcher hands each unit its environment bundle, the unit
//! runs the engine and reports back into the orchestrator store.
//!
//! Units run in-process on spawned tasks but only see the bundle, exactly as
//! a child process or container would.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    db::DbPool,
    dispatch::{DispatchError, UnitContext, WorkerDispatcher, WorkerHandle, WorkerParams},
    models::{
        ConnectionDescriptor, CreateRetentionPolicy, ExecutionOutcome, ExecutionStatus, JobType,
        RetentionPolicy,
    },
    retention::testing::Fixture,
    scheduler::Scheduler,
    worker,
};

struct InlineDispatcher {
    context: UnitContext,
    units: Mutex<Vec<JoinHandle<ExecutionOutcome>>>,
}

impl InlineDispatcher {
    fn new(orchestrator: ConnectionDescriptor, batch_size: u32) -> Self {
        Self {
            context: UnitContext {
                orchestrator: Some(orchestrator),
                batch_size,
                connect_timeout_secs: 5,
            },
            units: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every unit launched so far.
    async fn join(&self) -> Vec<ExecutionOutcome> {
        let units: Vec<_> = self.units.lock().drain(..).collect();
        let mut outcomes = Vec::new();
        for unit in units {
            outcomes.push(unit.await.expect("unit task panicked"));
        }
        outcomes
    }
}

#[async_trait]
impl WorkerDispatcher for InlineDispatcher {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn launch(
        &self,
        policy: &RetentionPolicy,
        job_type: JobType,
        execution_id: i64,
    ) -> Result<WorkerHandle, DispatchError> {
        let env: HashMap<String, String> =
            WorkerParams::for_policy(policy, job_type, Some(execution_id), &self.context)
                .to_env()
                .into_iter()
                .collect();
        let unit = tokio::spawn(async move { worker::run_unit(|key| env.get(key).cloned()).await });
        self.units.lock().push(unit);
        Ok(WorkerHandle::new(format!("inline-{execution_id}")))
    }
}

struct Harness {
    fixture: Fixture,
    db: Arc<DbPool>,
    dispatcher: Arc<InlineDispatcher>,
    scheduler: Scheduler,
}

impl Harness {
    async fn new(batch_size: u32) -> Self {
        let fixture = Fixture::new().await;
        let (orchestrator, db) = fixture.orchestrator().await;
        let db = Arc::new(db);
        let dispatcher = Arc::new(InlineDispatcher::new(orchestrator, batch_size));
        let scheduler = Scheduler::new(db.clone(), dispatcher.clone(), 0);
        Self {
            fixture,
            db,
            dispatcher,
            scheduler,
        }
    }

    async fn add_policy(&self, enabled: bool) -> RetentionPolicy {
        self.db
            .policies()
            .create(CreateRetentionPolicy {
                source: self.fixture.source.clone(),
                destination: self.fixture.destination.clone(),
                table_name: "orders".to_string(),
                date_column: "created_at".to_string(),
                archival_days: 30,
                deletion_days: 365,
                enabled,
            })
            .await
            .unwrap()
    }

    async fn cycle(&self, job_type: JobType) -> Vec<ExecutionOutcome> {
        let summary = self.scheduler.trigger_now(job_type).await.unwrap();
        assert_eq!(summary.launch_failures, 0);
        self.dispatcher.join().await
    }
}

#[tokio::test]
async fn test_archival_cycle_end_to_end() {
    let harness = Harness::new(100).await;
    let policy = harness.add_policy(true).await;
    harness.fixture.seed_orders(1, 250, 60).await;
    harness.fixture.seed_orders(1001, 10, 1).await;

    let outcomes = harness.cycle(JobType::Archival).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, ExecutionStatus::Completed);
    assert_eq!(outcomes[0].stats.batches, 3);

    let records = harness
        .db
        .executions()
        .list_by_policy(policy.id, 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.records_processed, 250);
    assert_eq!(record.records_archived, 250);
    assert!(record.completed_at.is_some());
    assert!(record.error_message.is_none());

    assert_eq!(harness.fixture.archive_count().await, 250);
    assert_eq!(harness.fixture.source_count().await, 10);

    let stamped: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM archive_orders WHERE archived_at IS NOT NULL AND archived_by = 'DAS'",
    )
    .fetch_one(&harness.fixture.archive_pool)
    .await
    .unwrap();
    assert_eq!(stamped, 250);

    // Nothing left to move
    let outcomes = harness.cycle(JobType::Archival).await;
    assert_eq!(outcomes[0].status, ExecutionStatus::Completed);
    assert_eq!(outcomes[0].stats.records_archived, 0);
}

#[tokio::test]
async fn test_purge_cycle_after_archival() {
    let harness = Harness::new(50).await;
    let policy = harness.add_policy(true).await;
    harness.fixture.seed_orders(1, 120, 60).await;
    harness.cycle(JobType::Archival).await;

    sqlx::query("UPDATE archive_orders SET created_at = ? WHERE id <= 70")
        .bind(Utc::now() - Duration::days(400))
        .execute(&harness.fixture.archive_pool)
        .await
        .unwrap();

    let outcomes = harness.cycle(JobType::Purge).await;
    assert_eq!(outcomes[0].status, ExecutionStatus::Completed);
    assert_eq!(outcomes[0].stats.batches, 2);

    let records = harness
        .db
        .executions()
        .list_by_policy(policy.id, 10)
        .await
        .unwrap();
    let purge = records
        .iter()
        .find(|r| r.job_type == JobType::Purge)
        .expect("purge record");
    assert_eq!(purge.status, ExecutionStatus::Completed);
    assert_eq!(purge.records_deleted, 70);
    assert_eq!(purge.records_processed, 70);
    assert_eq!(purge.records_archived, 0);

    assert_eq!(harness.fixture.archive_count().await, 50);
}

#[tokio::test]
async fn test_disabled_policy_untouched() {
    let harness = Harness::new(100).await;
    let policy = harness.add_policy(false).await;
    harness.fixture.seed_orders(1, 40, 60).await;

    let outcomes = harness.cycle(JobType::Archival).await;
    assert!(outcomes.is_empty());

    assert!(
        harness
            .db
            .executions()
            .list_by_policy(policy.id, 10)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(harness.fixture.source_count().await, 40);
}

#[tokio::test]
async fn test_failing_policy_does_not_block_others() {
    let harness = Harness::new(100).await;
    let healthy = harness.add_policy(true).await;
    let broken = harness
        .db
        .policies()
        .create(CreateRetentionPolicy {
            source: harness.fixture.source.clone(),
            destination: ConnectionDescriptor::sqlite("/nonexistent/dir/archive.db"),
            table_name: "orders".to_string(),
            date_column: "created_at".to_string(),
            archival_days: 30,
            deletion_days: 365,
            enabled: true,
        })
        .await
        .unwrap();
    harness.fixture.seed_orders(1, 30, 60).await;

    let outcomes = harness.cycle(JobType::Archival).await;
    assert_eq!(outcomes.len(), 2);

    let executions = harness.db.executions();
    let failed = &executions.list_by_policy(broken.id, 10).await.unwrap()[0];
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.records_processed, 0);
    assert!(!failed.error_message.clone().unwrap_or_default().is_empty());

    let completed = &executions.list_by_policy(healthy.id, 10).await.unwrap()[0];
    assert_eq!(completed.status, ExecutionStatus::Completed);
    assert_eq!(completed.records_archived, 30);
}
