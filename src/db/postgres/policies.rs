use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    db::{
        common::{DescriptorColumns, narrow},
        error::DbResult,
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

pub struct PostgresPolicyRepo {
    pool: PgPool,
}

impl PostgresPolicyRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn descriptor(row: &PgRow, prefix: &str) -> DbResult<DescriptorColumns> {
        Ok(DescriptorColumns {
            family: row.try_get(format!("{prefix}_type").as_str())?,
            host: row.try_get(format!("{prefix}_host").as_str())?,
            port: i64::from(row.try_get::<i32, _>(format!("{prefix}_port").as_str())?),
            database: row.try_get(format!("{prefix}_database").as_str())?,
            user: row.try_get(format!("{prefix}_user").as_str())?,
            password: row.try_get(format!("{prefix}_password").as_str())?,
        })
    }

    fn parse_policy(row: &PgRow) -> DbResult<RetentionPolicy> {
        Ok(RetentionPolicy {
            id: row.try_get("id")?,
            source: Self::descriptor(row, "source")?.into_descriptor("source")?,
            destination: Self::descriptor(row, "destination")?.into_descriptor("destination")?,
            table_name: row.try_get("table_name")?,
            date_column: row.try_get("date_column")?,
            archival_days: narrow("archival_days", row.try_get::<i32, _>("archival_days")?)?,
            deletion_days: narrow("deletion_days", row.try_get::<i32, _>("deletion_days")?)?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl PolicyRepo for PostgresPolicyRepo {
    async fn create(&self, input: CreateRetentionPolicy) -> DbResult<RetentionPolicy> {
        let query = format!(
            r#"
            INSERT INTO retention_policies (
                source_type, source_host, source_port, source_database, source_user, source_password,
                destination_type, destination_host, destination_port, destination_database,
                destination_user, destination_password,
                table_name, date_column, archival_days, deletion_days, enabled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {POLICY_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(input.source.family.as_str())
            .bind(&input.source.host)
            .bind(i32::from(input.source.port))
            .bind(&input.source.database)
            .bind(&input.source.user)
            .bind(&input.source.password)
            .bind(input.destination.family.as_str())
            .bind(&input.destination.host)
            .bind(i32::from(input.destination.port))
            .bind(&input.destination.database)
            .bind(&input.destination.user)
            .bind(&input.destination.password)
            .bind(&input.table_name)
            .bind(&input.date_column)
            .bind(narrow::<i32, u32>("archival_days", input.archival_days)?)
            .bind(narrow::<i32, u32>("deletion_days", input.deletion_days)?)
            .bind(input.enabled)
            .fetch_one(&self.pool)
            .await?;

        Self::parse_policy(&row)
    }

    async fn get(&self, id: i64) -> DbResult<Option<RetentionPolicy>> {
        let query = format!("SELECT {POLICY_COLUMNS} FROM retention_policies WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_policy).transpose()
    }

    async fn list_enabled(&self) -> DbResult<Vec<RetentionPolicy>> {
        let query = format!(
            "SELECT {POLICY_COLUMNS} FROM retention_policies WHERE enabled = TRUE ORDER BY id"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(Self::parse_policy).collect()
    }
}
