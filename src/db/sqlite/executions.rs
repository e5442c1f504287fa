use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    db::{
        common::{counter, parse_enum},
        error::{DbError, DbResult},
        repos::ExecutionRepo,
    },
    models::{ExecutionOutcome, ExecutionRecord, ExecutionStatus, JobType},
};

const EXECUTION_COLUMNS: &str = r#"
    id, policy_id, job_type, status, worker_handle,
    records_processed, records_archived, records_deleted,
    started_at, completed_at, error_message
"#;

pub struct SqliteExecutionRepo {
    pool: SqlitePool,
}

impl SqliteExecutionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_execution(row: &SqliteRow) -> DbResult<ExecutionRecord> {
        Ok(ExecutionRecord {
            id: row.try_get("id")?,
            policy_id: row.try_get("policy_id")?,
            job_type: parse_enum(&row.try_get::<String, _>("job_type")?)?,
            status: parse_enum(&row.try_get::<String, _>("status")?)?,
            worker_handle: row.try_get("worker_handle")?,
            records_processed: row.try_get("records_processed")?,
            records_archived: row.try_get("records_archived")?,
            records_deleted: row.try_get("records_deleted")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

#[async_trait]
impl ExecutionRepo for SqliteExecutionRepo {
    async fn create(&self, policy_id: i64, job_type: JobType) -> DbResult<ExecutionRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_executions (policy_id, job_type, status, started_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(policy_id)
        .bind(job_type.as_str())
        .bind(ExecutionStatus::Running.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get(result.last_insert_rowid())
            .await?
            .ok_or(DbError::NotFound)
    }

    async fn set_worker_handle(&self, id: i64, handle: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE job_executions SET worker_handle = ? WHERE id = ?")
            .bind(handle)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn complete(&self, id: i64, outcome: &ExecutionOutcome) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = ?, records_processed = ?, records_archived = ?, records_deleted = ?,
                completed_at = ?, error_message = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(outcome.status.as_str())
        .bind(counter(outcome.stats.records_processed))
        .bind(counter(outcome.stats.records_archived))
        .bind(counter(outcome.stats.records_deleted))
        .bind(Utc::now())
        .bind(outcome.error_message.as_deref())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: i64) -> DbResult<Option<ExecutionRecord>> {
        let query = format!("SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_execution).transpose()
    }

    async fn list_by_policy(&self, policy_id: i64, limit: i64) -> DbResult<Vec<ExecutionRecord>> {
        let query = format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE policy_id = ? ORDER BY id DESC LIMIT ?"
        );
        let rows = sqlx::query(&query)
            .bind(policy_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_execution).collect()
    }

    async fn fail_stale(
        &self,
        job_type: JobType,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = 'failed', completed_at = ?, error_message = ?
            WHERE job_type = ? AND status = 'running' AND started_at < ?
            "#,
        )
        .bind(Utc::now())
        .bind(message)
        .bind(job_type.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
