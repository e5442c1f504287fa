use thiserror::Error;

use crate::{models::JobStats, tables::TableError};

/// Why an engine run failed.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A database was unreachable at start; no batch was attempted.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The source structure could not be read, the archive table could not be
    /// created, or the table lacks a single-column primary key.
    #[error("Schema error: {0}")]
    Schema(String),

    /// A batch's select, insert or delete failed. Earlier batches stay committed.
    #[error("Batch {batch} failed: {message}")]
    Batch { batch: u64, message: String },
}

impl EngineError {
    pub(crate) fn schema(context: &str, err: TableError) -> Self {
        EngineError::Schema(format!("{}: {}", context, err))
    }

    pub(crate) fn batch(batch: u64, step: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Batch {
            batch,
            message: format!("{} failed: {}", step, err),
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Connection(_) => "connection",
            EngineError::Schema(_) => "schema",
            EngineError::Batch { .. } => "batch",
        }
    }
}

/// A failed run together with the counters of the batches that did commit.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct JobFailure {
    pub error: EngineError,
    pub stats: JobStats,
}

impl JobFailure {
    pub fn new(error: EngineError, stats: JobStats) -> Self {
        Self { error, stats }
    }

    /// Failure before any work happened.
    pub fn at_start(error: EngineError) -> Self {
        Self::new(error, JobStats::default())
    }
}
