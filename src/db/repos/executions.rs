use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::DbResult,
    models::{ExecutionOutcome, ExecutionRecord, JobType},
};

#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    /// Create a `running` record for a unit about to be dispatched.
    async fn create(&self, policy_id: i64, job_type: JobType) -> DbResult<ExecutionRecord>;

    /// Attach the worker handle returned by the dispatcher.
    async fn set_worker_handle(&self, id: i64, handle: &str) -> DbResult<()>;

    /// Write the terminal outcome of an execution.
    ///
    /// Only a `running` record is updated. Returns `false` when the record
    /// was already terminal (or does not exist), leaving it untouched.
    async fn complete(&self, id: i64, outcome: &ExecutionOutcome) -> DbResult<bool>;

    /// Get an execution record by its ID.
    async fn get(&self, id: i64) -> DbResult<Option<ExecutionRecord>>;

    /// List executions of a policy, newest first.
    async fn list_by_policy(&self, policy_id: i64, limit: i64) -> DbResult<Vec<ExecutionRecord>>;

    /// Mark `running` records of `job_type` started before `cutoff` as failed
    /// with `message`. Returns the number of records updated.
    async fn fail_stale(
        &self,
        job_type: JobType,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> DbResult<u64>;
}
