use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    db::{
        common::{DescriptorColumns, narrow},
        error::{DbError, DbResult},
        repos::PolicyRepo,
    },
    models::{CreateRetentionPolicy, RetentionPolicy},
};

const POLICY_COLUMNS: &str = r#"
    id,
    source_type, source_host, source_port, source_database, source_user, source_password,
    destination_type, destination_host, destination_port, destination_database,
    destination_user, destination_password,
    table_name, date_column, archival_days, deletion_days, enabled, created_at, updated_at
"#;

pub struct SqlitePolicyRepo {
    pool: SqlitePool,
}

impl SqlitePolicyRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn descriptor(row: &SqliteRow, prefix: &str) -> DbResult<DescriptorColumns> {
        Ok(DescriptorColumns {
            family: row.try_get(format!("{prefix}_type").as_str())?,
            host: row.try_get(format!("{prefix}_host").as_str())?,
            port: row.try_get(format!("{prefix}_port").as_str())?,
            database: row.try_get(format!("{prefix}_database").as_str())?,
            user: row.try_get(format!("{prefix}_user").as_str())?,
            password: row.try_get(format!("{prefix}_password").as_str())?,
        })
    }

    fn parse_policy(row: &SqliteRow) -> DbResult<RetentionPolicy> {
        Ok(RetentionPolicy {
            id: row.try_get("id")?,
            source: Self::descriptor(row, "source")?.into_descriptor("source")?,
            destination: Self::descriptor(row, "destination")?.into_descriptor("destination")?,
            table_name: row.try_get("table_name")?,
            date_column: row.try_get("date_column")?,
            archival_days: narrow("archival_days", row.try_get::<i64, _>("archival_days")?)?,
            deletion_days: narrow("deletion_days", row.try_get::<i64, _>("deletion_days")?)?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl PolicyRepo for SqlitePolicyRepo {
    async fn create(&self, input: CreateRetentionPolicy) -> DbResult<RetentionPolicy> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO retention_policies (
                source_type, source_host, source_port, source_database, source_user, source_password,
                destination_type, destination_host, destination_port, destination_database,
                destination_user, destination_password,
                table_name, date_column, archival_days, deletion_days, enabled, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(input.source.family.as_str())
        .bind(&input.source.host)
        .bind(i64::from(input.source.port))
        .bind(&input.source.database)
        .bind(&input.source.user)
        .bind(&input.source.password)
        .bind(input.destination.family.as_str())
        .bind(&input.destination.host)
        .bind(i64::from(input.destination.port))
        .bind(&input.destination.database)
        .bind(&input.destination.user)
        .bind(&input.destination.password)
        .bind(&input.table_name)
        .bind(&input.date_column)
        .bind(i64::from(input.archival_days))
        .bind(i64::from(input.deletion_days))
        .bind(input.enabled)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(result.last_insert_rowid())
            .await?
            .ok_or(DbError::NotFound)
    }

    async fn get(&self, id: i64) -> DbResult<Option<RetentionPolicy>> {
        let query = format!("SELECT {POLICY_COLUMNS} FROM retention_policies WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_policy).transpose()
    }

    async fn list_enabled(&self) -> DbResult<Vec<RetentionPolicy>> {
        let query = format!(
            "SELECT {POLICY_COLUMNS} FROM retention_policies WHERE enabled = 1 ORDER BY id"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(Self::parse_policy).collect()
    }
}
