use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

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

pub struct PostgresExecutionRepo {
    pool: PgPool,
}

impl PostgresExecutionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_execution(row: &PgRow) -> DbResult<ExecutionRecord> {
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
impl ExecutionRepo for PostgresExecutionRepo {
    async fn create(&self, policy_id: i64, job_type: JobType) -> DbResult<ExecutionRecord> {
        let query = format!(
            r#"
            INSERT INTO job_executions (policy_id, job_type, status, started_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(policy_id)
            .bind(job_type.as_str())
            .bind(ExecutionStatus::Running.as_str())
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        Self::parse_execution(&row)
    }

    async fn set_worker_handle(&self, id: i64, handle: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE job_executions SET worker_handle = $1 WHERE id = $2")
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
            SET status = $1, records_processed = $2, records_archived = $3, records_deleted = $4,
                completed_at = NOW(), error_message = $5
            WHERE id = $6 AND status = 'running'
            "#,
        )
        .bind(outcome.status.as_str())
        .bind(counter(outcome.stats.records_processed))
        .bind(counter(outcome.stats.records_archived))
        .bind(counter(outcome.stats.records_deleted))
        .bind(outcome.error_message.as_deref())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: i64) -> DbResult<Option<ExecutionRecord>> {
        let query = format!("SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_execution).transpose()
    }

    async fn list_by_policy(&self, policy_id: i64, limit: i64) -> DbResult<Vec<ExecutionRecord>> {
        let query = format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE policy_id = $1 ORDER BY id DESC LIMIT $2"
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
            SET status = 'failed', completed_at = NOW(), error_message = $1
            WHERE job_type = $2 AND status = 'running' AND started_at < $3
            "#,
        )
        .bind(message)
        .bind(job_type.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
