//! Archival and purge engines.
//!
//! An engine run handles one table of one policy: the archival engine moves
//! rows older than the archival window from the source table into
//! `archive_<table>` in the destination database, and the purge engine deletes
//! archived rows older than the deletion window. Both work in bounded batches,
//! each committed on its own, so a failed run keeps every batch it finished.
//!
//! Engines never retry; the next scheduled cycle is the retry.

mod archival;
mod error;
mod purge;
#[cfg(all(test, feature = "database-sqlite"))]
pub(crate) mod testing;

use std::time::Duration;

use chrono::{DateTime, Utc};
pub use archival::ArchivalEngine;
pub use error::{EngineError, JobFailure};
pub use purge::PurgeEngine;

use crate::{
    models::{ConnectionDescriptor, archive_table_name},
    tables::{self, TableStore},
};

/// The table-level parameters of one engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableJob {
    pub table_name: String,
    pub date_column: String,
    pub archival_days: u32,
    pub deletion_days: u32,
    pub batch_size: u32,
}

impl TableJob {
    pub fn archive_table(&self) -> String {
        archive_table_name(&self.table_name)
    }

    /// Source rows with `date_column` before this instant are archived.
    pub fn archival_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.archival_days))
    }

    /// Archived rows with `date_column` before this instant are purged.
    pub fn deletion_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.deletion_days))
    }

    fn batch_limit(&self) -> u64 {
        u64::from(self.batch_size.max(1))
    }
}

async fn connect_store(
    role: &str,
    descriptor: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> Result<Box<dyn TableStore>, EngineError> {
    tables::connect(descriptor, connect_timeout)
        .await
        .map_err(|e| {
            EngineError::Connection(format!(
                "{} database {}: {}",
                role,
                descriptor.location(),
                e
            ))
        })
}
