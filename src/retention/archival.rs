use std::time::Duration;

use chrono::Utc;

use super::{EngineError, JobFailure, TableJob, connect_store};
use crate::{
    models::{ConnectionDescriptor, JobStats},
    tables::{ARCHIVED_AT_COLUMN, ARCHIVED_BY_COLUMN, TableStore},
};

/// Moves aging rows from a source table into its archive table.
///
/// Each batch is inserted into the archive in one transaction, then deleted
/// from the source by primary key in a second one. The two databases share no
/// transaction coordinator: a crash between the commits leaves the batch in
/// both places, and the next run re-moves it (archive inserts skip existing
/// keys). Rows are never deleted from the source before they are archived.
pub struct ArchivalEngine {
    source: Box<dyn TableStore>,
    archive: Box<dyn TableStore>,
    job: TableJob,
}

impl ArchivalEngine {
    pub fn new(source: Box<dyn TableStore>, archive: Box<dyn TableStore>, job: TableJob) -> Self {
        Self {
            source,
            archive,
            job,
        }
    }

    /// Connect to both databases, failing fast if either is unreachable.
    pub async fn connect(
        source: &ConnectionDescriptor,
        destination: &ConnectionDescriptor,
        job: TableJob,
        connect_timeout: Duration,
    ) -> Result<Self, JobFailure> {
        let source_store = connect_store("source", source, connect_timeout)
            .await
            .map_err(JobFailure::at_start)?;

        let archive_store = match connect_store("destination", destination, connect_timeout).await
        {
            Ok(store) => store,
            Err(e) => {
                source_store.close().await;
                return Err(JobFailure::at_start(e));
            }
        };

        Ok(Self::new(source_store, archive_store, job))
    }

    /// Run to completion. Both connections are closed before returning,
    /// whatever the outcome.
    pub async fn run(self) -> Result<JobStats, JobFailure> {
        let mut stats = JobStats::default();
        let result = self.execute(&mut stats).await;

        self.source.close().await;
        self.archive.close().await;

        match result {
            Ok(()) => {
                tracing::info!(
                    table = %self.job.table_name,
                    records_archived = stats.records_archived,
                    batches = stats.batches,
                    "Archival completed"
                );
                Ok(stats)
            }
            Err(error) => {
                tracing::error!(
                    table = %self.job.table_name,
                    error = %error,
                    kind = error.kind(),
                    records_archived = stats.records_archived,
                    "Archival failed"
                );
                Err(JobFailure::new(error, stats))
            }
        }
    }

    async fn execute(&self, stats: &mut JobStats) -> Result<(), EngineError> {
        let table = self.job.table_name.as_str();
        let archive_table = self.job.archive_table();

        if self.source.family() != self.archive.family() {
            return Err(EngineError::Schema(format!(
                "source ({}) and destination ({}) must be the same database type",
                self.source.family(),
                self.archive.family()
            )));
        }

        self.ensure_archive_table(&archive_table).await?;

        let key = self
            .source
            .primary_key(table)
            .await
            .map_err(|e| EngineError::schema("reading primary key", e))?;

        let archive_columns = self
            .archive
            .columns(&archive_table)
            .await
            .map_err(|e| EngineError::schema("reading archive columns", e))?;
        let archive_has_bookkeeping = archive_columns.iter().any(|c| c == ARCHIVED_AT_COLUMN)
            && archive_columns.iter().any(|c| c == ARCHIVED_BY_COLUMN);

        let cutoff = self.job.archival_cutoff(Utc::now());
        let limit = self.job.batch_limit();

        tracing::info!(
            table,
            archive_table = %archive_table,
            key_column = %key,
            cutoff = %cutoff,
            batch_size = limit,
            "Starting archival"
        );

        loop {
            let batch_no = stats.batches + 1;

            let batch = self
                .source
                .select_batch(table, &self.job.date_column, cutoff, limit)
                .await
                .map_err(|e| EngineError::batch(batch_no, "select", e))?;
            if batch.is_empty() {
                break;
            }

            let rows = batch.len() as u64;
            let keys = batch
                .key_values(&key)
                .map_err(|e| EngineError::batch(batch_no, "collect keys", e))?;

            let batch = if archive_has_bookkeeping && !batch.has_column(ARCHIVED_AT_COLUMN) {
                batch.with_bookkeeping(Utc::now())
            } else {
                batch
            };

            let inserted = self
                .archive
                .insert_batch(&archive_table, &key, &batch)
                .await
                .map_err(|e| EngineError::batch(batch_no, "insert", e))?;
            if inserted < rows {
                tracing::debug!(
                    batch = batch_no,
                    skipped = rows - inserted,
                    "Rows already present in archive"
                );
            }

            let deleted = self
                .source
                .delete_keys(table, &key, &keys)
                .await
                .map_err(|e| EngineError::batch(batch_no, "delete", e))?;
            // Selecting the same rows again would never terminate.
            if deleted == 0 {
                return Err(EngineError::Batch {
                    batch: batch_no,
                    message: format!("delete removed none of the {} archived rows", rows),
                });
            }

            stats.records_processed += rows;
            stats.records_archived += rows;
            stats.batches += 1;

            tracing::debug!(
                batch = batch_no,
                rows,
                deleted,
                total = stats.records_archived,
                "Batch archived"
            );
        }

        Ok(())
    }

    /// Clone the source table into the destination on first use.
    async fn ensure_archive_table(&self, archive_table: &str) -> Result<(), EngineError> {
        let exists = self
            .archive
            .table_exists(archive_table)
            .await
            .map_err(|e| EngineError::schema("checking archive table", e))?;
        if exists {
            return Ok(());
        }

        let table = self.job.table_name.as_str();
        tracing::info!(table, archive_table, "Creating archive table");

        let ddl = self
            .source
            .table_definition(table)
            .await
            .map_err(|e| EngineError::schema("reading source table definition", e))?;
        let ddl = self
            .archive
            .rename_definition(&ddl, archive_table)
            .map_err(|e| EngineError::schema("rewriting table definition", e))?;
        self.archive
            .create_table(&ddl)
            .await
            .map_err(|e| EngineError::schema("creating archive table", e))?;

        if let Err(e) = self.archive.add_bookkeeping_columns(archive_table).await {
            tracing::warn!(
                archive_table,
                error = %e,
                "Could not add bookkeeping columns; archiving without them"
            );
        }

        Ok(())
    }
}
