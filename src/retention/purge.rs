use std::time::Duration;

use chrono::Utc;

use super::{EngineError, JobFailure, TableJob, connect_store};
use crate::{
    models::{ConnectionDescriptor, JobStats},
    tables::TableStore,
};

/// Deletes archived rows past the deletion window, in bounded batches.
///
/// Only the destination database is touched.
pub struct PurgeEngine {
    archive: Box<dyn TableStore>,
    job: TableJob,
}

impl PurgeEngine {
    pub fn new(archive: Box<dyn TableStore>, job: TableJob) -> Self {
        Self { archive, job }
    }

    pub async fn connect(
        destination: &ConnectionDescriptor,
        job: TableJob,
        connect_timeout: Duration,
    ) -> Result<Self, JobFailure> {
        let archive = connect_store("destination", destination, connect_timeout)
            .await
            .map_err(JobFailure::at_start)?;
        Ok(Self::new(archive, job))
    }

    /// Run to completion, closing the connection on every path.
    pub async fn run(self) -> Result<JobStats, JobFailure> {
        let mut stats = JobStats::default();
        let result = self.execute(&mut stats).await;

        self.archive.close().await;

        match result {
            Ok(()) => {
                tracing::info!(
                    table = %self.job.archive_table(),
                    records_deleted = stats.records_deleted,
                    batches = stats.batches,
                    "Purge completed"
                );
                Ok(stats)
            }
            Err(error) => {
                tracing::error!(
                    table = %self.job.archive_table(),
                    error = %error,
                    kind = error.kind(),
                    records_deleted = stats.records_deleted,
                    "Purge failed"
                );
                Err(JobFailure::new(error, stats))
            }
        }
    }

    async fn execute(&self, stats: &mut JobStats) -> Result<(), EngineError> {
        let archive_table = self.job.archive_table();
        let date_column = self.job.date_column.as_str();

        let exists = self
            .archive
            .table_exists(&archive_table)
            .await
            .map_err(|e| EngineError::schema("checking archive table", e))?;
        if !exists {
            tracing::info!(
                archive_table = %archive_table,
                "Archive table does not exist yet, nothing to purge"
            );
            return Ok(());
        }

        let cutoff = self.job.deletion_cutoff(Utc::now());
        let limit = self.job.batch_limit();

        // The count is informational only.
        let eligible = match self
            .archive
            .count_before(&archive_table, date_column, cutoff)
            .await
        {
            Ok(eligible) => Some(eligible),
            Err(e) => {
                tracing::warn!(
                    archive_table = %archive_table,
                    error = %e,
                    "Could not count expired rows"
                );
                None
            }
        };
        tracing::info!(
            archive_table = %archive_table,
            cutoff = %cutoff,
            eligible = ?eligible,
            batch_size = limit,
            "Starting purge"
        );

        loop {
            let batch_no = stats.batches + 1;
            let deleted = self
                .archive
                .delete_before(&archive_table, date_column, cutoff, limit)
                .await
                .map_err(|e| EngineError::batch(batch_no, "delete", e))?;
            if deleted == 0 {
                break;
            }

            stats.records_deleted += deleted;
            stats.records_processed = stats.records_deleted;
            stats.batches += 1;

            tracing::debug!(
                batch = batch_no,
                deleted,
                total = stats.records_deleted,
                "Batch purged"
            );
        }

        Ok(())
    }
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use rstest::rstest;

    use super::*;
    use crate::{
        retention::{ArchivalEngine, testing::Fixture},
        tables::{RowBatch, SchemaCloner, SqlValue, TableError, TableResult, connect},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Archive every seeded row, then age part of the archive past the
    /// deletion window.
    async fn archived_fixture(total: i64, expired: i64) -> Fixture {
        let fixture = Fixture::new().await;
        fixture.seed_orders(1, total, 90).await;
        ArchivalEngine::connect(
            &fixture.source,
            &fixture.destination,
            fixture.job(1000),
            TIMEOUT,
        )
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

        let old = Utc::now() - ChronoDuration::days(400);
        sqlx::query("UPDATE archive_orders SET created_at = ? WHERE id <= ?")
            .bind(old)
            .bind(expired)
            .execute(&fixture.archive_pool)
            .await
            .unwrap();
        fixture
    }

    #[rstest]
    #[case::remainder(250, 100, 3)]
    #[case::exact_multiple(100, 50, 2)]
    #[case::nothing_expired(0, 50, 0)]
    #[tokio::test]
    async fn test_batching(#[case] expired: i64, #[case] batch_size: u32, #[case] batches: u64) {
        let fixture = archived_fixture(300, expired).await;

        let stats = PurgeEngine::connect(&fixture.destination, fixture.job(batch_size), TIMEOUT)
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(stats.batches, batches);
        assert_eq!(stats.records_deleted, expired as u64);
        assert_eq!(stats.records_processed, expired as u64);
        assert_eq!(stats.records_archived, 0);
        assert_eq!(fixture.archive_count().await, 300 - expired);
    }

    #[tokio::test]
    async fn test_missing_archive_table_completes() {
        let fixture = Fixture::new().await;

        let stats = PurgeEngine::connect(&fixture.destination, fixture.job(100), TIMEOUT)
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(stats, JobStats::default());
    }

    #[tokio::test]
    async fn test_destination_unreachable() {
        let fixture = Fixture::new().await;
        let unreachable = ConnectionDescriptor::sqlite("/nonexistent/dir/archive.db");

        let failure = match PurgeEngine::connect(&unreachable, fixture.job(100), TIMEOUT).await {
            Ok(_) => panic!("connect should fail"),
            Err(failure) => failure,
        };

        assert!(matches!(failure.error, EngineError::Connection(_)));
        assert_eq!(failure.stats, JobStats::default());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_committed_batches() {
        let fixture = archived_fixture(300, 250).await;
        let archive = connect(&fixture.destination, TIMEOUT).await.unwrap();
        let engine = PurgeEngine::new(
            Box::new(Flaky {
                inner: archive,
                fail_delete_on: Some(3),
                fail_count: false,
                deletes: AtomicU64::new(0),
            }),
            fixture.job(100),
        );

        let failure = engine.run().await.unwrap_err();

        assert!(matches!(failure.error, EngineError::Batch { batch: 3, .. }));
        assert_eq!(failure.stats.batches, 2);
        assert_eq!(failure.stats.records_deleted, 200);
        assert_eq!(failure.stats.records_processed, 200);
        assert_eq!(fixture.archive_count().await, 100);
    }

    #[tokio::test]
    async fn test_count_failure_does_not_stop_purge() {
        let fixture = archived_fixture(300, 120).await;
        let archive = connect(&fixture.destination, TIMEOUT).await.unwrap();
        let engine = PurgeEngine::new(
            Box::new(Flaky {
                inner: archive,
                fail_delete_on: None,
                fail_count: true,
                deletes: AtomicU64::new(0),
            }),
            fixture.job(50),
        );

        let stats = engine.run().await.unwrap();

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.records_deleted, 120);
        assert_eq!(fixture.archive_count().await, 180);
    }

    /// Fails `count_before` and/or the `fail_delete_on`-th `delete_before`;
    /// every other call is delegated.
    struct Flaky {
        inner: Box<dyn TableStore>,
        fail_delete_on: Option<u64>,
        fail_count: bool,
        deletes: AtomicU64,
    }

    #[async_trait]
    impl SchemaCloner for Flaky {
        fn quote(&self, ident: &str) -> String {
            self.inner.quote(ident)
        }
        async fn table_definition(&self, table: &str) -> TableResult<String> {
            self.inner.table_definition(table).await
        }
        async fn create_table(&self, ddl: &str) -> TableResult<()> {
            self.inner.create_table(ddl).await
        }
        async fn add_bookkeeping_columns(&self, table: &str) -> TableResult<()> {
            self.inner.add_bookkeeping_columns(table).await
        }
    }

    #[async_trait]
    impl TableStore for Flaky {
        fn family(&self) -> crate::models::DatabaseFamily {
            self.inner.family()
        }
        async fn table_exists(&self, table: &str) -> TableResult<bool> {
            self.inner.table_exists(table).await
        }
        async fn primary_key(&self, table: &str) -> TableResult<String> {
            self.inner.primary_key(table).await
        }
        async fn columns(&self, table: &str) -> TableResult<Vec<String>> {
            self.inner.columns(table).await
        }
        async fn select_batch(
            &self,
            table: &str,
            date_column: &str,
            cutoff: DateTime<Utc>,
            limit: u64,
        ) -> TableResult<RowBatch> {
            self.inner
                .select_batch(table, date_column, cutoff, limit)
                .await
        }
        async fn insert_batch(
            &self,
            table: &str,
            key_column: &str,
            batch: &RowBatch,
        ) -> TableResult<u64> {
            self.inner.insert_batch(table, key_column, batch).await
        }
        async fn delete_keys(
            &self,
            table: &str,
            key_column: &str,
            keys: &[SqlValue],
        ) -> TableResult<u64> {
            self.inner.delete_keys(table, key_column, keys).await
        }
        async fn delete_before(
            &self,
            table: &str,
            date_column: &str,
            cutoff: DateTime<Utc>,
            limit: u64,
        ) -> TableResult<u64> {
            let call = self.deletes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_delete_on == Some(call) {
                return Err(TableError::Schema("simulated delete failure".into()));
            }
            self.inner
                .delete_before(table, date_column, cutoff, limit)
                .await
        }
        async fn count_before(
            &self,
            table: &str,
            date_column: &str,
            cutoff: DateTime<Utc>,
        ) -> TableResult<u64> {
            if self.fail_count {
                return Err(TableError::Schema("simulated count failure".into()));
            }
            self.inner.count_before(table, date_column, cutoff).await
        }
        async fn close(&self) {
            self.inner.close().await
        }
    }
}
