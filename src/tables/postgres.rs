use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    Column as _, PgPool, Row, TypeInfo, ValueRef,
    postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow},
    query::Query,
};

use super::{
    ARCHIVED_AT_COLUMN, ARCHIVED_BY_COLUMN, Column, RowBatch, SchemaCloner, SqlValue, TableError,
    TableResult, TableStore, check_identifier, count_to_u64,
};
use crate::models::{ARCHIVED_BY_TAG, ConnectionDescriptor, DatabaseFamily};

type PgQuery<'q> = Query<'q, sqlx::Postgres, PgArguments>;

/// PostgreSQL table store. Tables are resolved against the connection's
/// `search_path`.
pub struct PostgresTables {
    pool: PgPool,
}

impl PostgresTables {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        descriptor: &ConnectionDescriptor,
        connect_timeout: Duration,
    ) -> TableResult<Self> {
        let options = PgConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port)
            .database(&descriptor.database)
            .username(&descriptor.user)
            .password(&descriptor.password)
            // Cutoffs are UTC; `timestamp without time zone` columns compare
            // against them in the session zone.
            .options([("timezone", "UTC")]);

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self::new(pool))
    }

    fn decode_row(row: &PgRow) -> TableResult<Vec<SqlValue>> {
        (0..row.len())
            .map(|i| {
                if row.try_get_raw(i)?.is_null() {
                    return Ok(SqlValue::Null);
                }
                let column = row.column(i);
                let value = match column.type_info().name() {
                    "BOOL" => SqlValue::Bool(row.try_get(i)?),
                    "INT2" => SqlValue::SmallInt(row.try_get(i)?),
                    "INT4" => SqlValue::Int(row.try_get(i)?),
                    "INT8" => SqlValue::BigInt(row.try_get(i)?),
                    "FLOAT4" => SqlValue::Real(row.try_get(i)?),
                    "FLOAT8" => SqlValue::Double(row.try_get(i)?),
                    "NUMERIC" => SqlValue::Decimal(row.try_get(i)?),
                    "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => SqlValue::Text(row.try_get(i)?),
                    "BYTEA" => SqlValue::Bytes(row.try_get(i)?),
                    "DATE" => SqlValue::Date(row.try_get(i)?),
                    "TIME" => SqlValue::Time(row.try_get(i)?),
                    "TIMESTAMP" => SqlValue::DateTime(row.try_get(i)?),
                    "TIMESTAMPTZ" => SqlValue::TimestampTz(row.try_get(i)?),
                    "UUID" => SqlValue::Uuid(row.try_get(i)?),
                    "JSON" | "JSONB" => SqlValue::Json(row.try_get(i)?),
                    other => {
                        return Err(TableError::UnsupportedType {
                            column: column.name().to_string(),
                            type_name: other.to_string(),
                        });
                    }
                };
                Ok(value)
            })
            .collect()
    }

    fn bind_value<'q>(query: PgQuery<'q>, value: &SqlValue) -> PgQuery<'q> {
        match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::SmallInt(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::BigInt(v) => query.bind(*v),
            // No unsigned types; values past i64 travel as NUMERIC.
            SqlValue::UnsignedBigInt(v) => match i64::try_from(*v) {
                Ok(signed) => query.bind(signed),
                Err(_) => query.bind(Decimal::from(*v)),
            },
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Double(v) => query.bind(*v),
            SqlValue::Decimal(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Bytes(v) => query.bind(v.clone()),
            SqlValue::Date(v) => query.bind(*v),
            SqlValue::Time(v) => query.bind(*v),
            SqlValue::DateTime(v) => query.bind(*v),
            SqlValue::TimestampTz(v) => query.bind(*v),
            SqlValue::Uuid(v) => query.bind(*v),
            SqlValue::Json(v) => query.bind(v.clone()),
        }
    }

    /// `(name, SQL type, not null)` for every live column of `table`.
    async fn attributes(&self, table: &str) -> TableResult<Vec<(String, String, bool)>> {
        let rows = sqlx::query(
            r#"
            SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), a.attnotnull
            FROM pg_attribute a
            WHERE a.attrelid = to_regclass(quote_ident($1))
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY a.attnum
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?)))
            .collect()
    }

    async fn key_columns(&self, table: &str) -> TableResult<Vec<String>> {
        let keys = sqlx::query_scalar(
            r#"
            SELECT a.attname::text
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            WHERE i.indrelid = to_regclass(quote_ident($1))
              AND i.indisprimary
            ORDER BY array_position(i.indkey, a.attnum)
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }
}

/// `$start, $start+1, …` for `n` positional parameters, each cast to its
/// column's type.
fn cast_placeholders(types: &[String], start: usize) -> String {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| format!("CAST(${} AS {})", start + i, ty))
        .collect::<Vec<_>>()
        .join(", ")
}

fn numbered_placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn limit_param(limit: u64) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl SchemaCloner for PostgresTables {
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident)
    }

    /// PostgreSQL has no `SHOW CREATE TABLE`; the statement is rebuilt from
    /// the catalog. Defaults, sequences and indexes other than the primary key
    /// are not carried over: archived rows keep their original values.
    async fn table_definition(&self, table: &str) -> TableResult<String> {
        check_identifier(table)?;

        let attributes = self.attributes(table).await?;
        if attributes.is_empty() {
            return Err(TableError::Schema(format!("table {} not found", table)));
        }

        let mut lines: Vec<String> = attributes
            .iter()
            .map(|(name, ty, not_null)| {
                let mut line = format!("    {} {}", self.quote(name), ty);
                if *not_null {
                    line.push_str(" NOT NULL");
                }
                line
            })
            .collect();

        let keys = self.key_columns(table).await?;
        if !keys.is_empty() {
            let quoted = keys
                .iter()
                .map(|k| self.quote(k))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("    PRIMARY KEY ({})", quoted));
        }

        Ok(format!(
            "CREATE TABLE {} (\n{}\n)",
            self.quote(table),
            lines.join(",\n")
        ))
    }

    async fn create_table(&self, ddl: &str) -> TableResult<()> {
        sqlx::query(ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn add_bookkeeping_columns(&self, table: &str) -> TableResult<()> {
        check_identifier(table)?;

        sqlx::query(&format!(
            "ALTER TABLE {} \
             ADD COLUMN IF NOT EXISTS {ARCHIVED_AT_COLUMN} TIMESTAMPTZ DEFAULT NOW(), \
             ADD COLUMN IF NOT EXISTS {ARCHIVED_BY_COLUMN} VARCHAR(50) DEFAULT '{ARCHIVED_BY_TAG}'",
            self.quote(table)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for PostgresTables {
    fn family(&self) -> DatabaseFamily {
        DatabaseFamily::Postgres
    }

    async fn table_exists(&self, table: &str) -> TableResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn primary_key(&self, table: &str) -> TableResult<String> {
        let mut keys = self.key_columns(table).await?;
        match keys.len() {
            1 => Ok(keys.remove(0)),
            0 => Err(TableError::Schema(format!(
                "table {} has no primary key",
                table
            ))),
            n => Err(TableError::Schema(format!(
                "table {} has a composite primary key ({} columns); a single-column key is required",
                table, n
            ))),
        }
    }

    async fn columns(&self, table: &str) -> TableResult<Vec<String>> {
        Ok(self
            .attributes(table)
            .await?
            .into_iter()
            .map(|(name, _, _)| name)
            .collect())
    }

    async fn select_batch(
        &self,
        table: &str,
        date_column: &str,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> TableResult<RowBatch> {
        check_identifier(table)?;
        check_identifier(date_column)?;

        let query = format!(
            "SELECT * FROM {} WHERE {} < $1 LIMIT $2",
            self.quote(table),
            self.quote(date_column)
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await?;

        let Some(first) = rows.first() else {
            return Ok(RowBatch::default());
        };
        let columns = first
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), c.type_info().name()))
            .collect();
        let rows = rows
            .iter()
            .map(Self::decode_row)
            .collect::<TableResult<Vec<_>>>()?;

        Ok(RowBatch { columns, rows })
    }

    async fn insert_batch(
        &self,
        table: &str,
        key_column: &str,
        batch: &RowBatch,
    ) -> TableResult<u64> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        if batch.is_empty() {
            return Ok(0);
        }
        for column in &batch.columns {
            check_identifier(&column.name)?;
        }

        // Cast every parameter to the target column's declared type so text
        // bound for NULLs and wider integers land correctly.
        let target_types: HashMap<String, String> = self
            .attributes(table)
            .await?
            .into_iter()
            .map(|(name, ty, _)| (name, ty))
            .collect();
        let types: Vec<String> = batch
            .columns
            .iter()
            .map(|c| {
                target_types
                    .get(&c.name)
                    .cloned()
                    .unwrap_or_else(|| c.type_name.clone())
            })
            .collect();

        let column_list = batch
            .columns
            .iter()
            .map(|c| self.quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            self.quote(table),
            column_list,
            cast_placeholders(&types, 1)
        );

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for row in &batch.rows {
            let query = row
                .iter()
                .fold(sqlx::query(&statement), |q, v| Self::bind_value(q, v));
            inserted += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        Ok(inserted)
    }

    async fn delete_keys(
        &self,
        table: &str,
        key_column: &str,
        keys: &[SqlValue],
    ) -> TableResult<u64> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        if keys.is_empty() {
            return Ok(0);
        }

        let statement = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.quote(table),
            self.quote(key_column),
            numbered_placeholders(keys.len())
        );

        let mut tx = self.pool.begin().await?;
        let query = keys
            .iter()
            .fold(sqlx::query(&statement), |q, v| Self::bind_value(q, v));
        let deleted = query.execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        Ok(deleted)
    }

    async fn delete_before(
        &self,
        table: &str,
        date_column: &str,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> TableResult<u64> {
        check_identifier(table)?;
        check_identifier(date_column)?;

        let quoted = self.quote(table);
        let statement = format!(
            "DELETE FROM {quoted} WHERE ctid IN (SELECT ctid FROM {quoted} WHERE {} < $1 LIMIT $2)",
            self.quote(date_column)
        );

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&statement)
            .bind(cutoff)
            .bind(limit_param(limit))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(deleted)
    }

    async fn count_before(
        &self,
        table: &str,
        date_column: &str,
        cutoff: DateTime<Utc>,
    ) -> TableResult<u64> {
        check_identifier(table)?;
        check_identifier(date_column)?;

        let query = format!(
            "SELECT COUNT(*) FROM {} WHERE {} < $1",
            self.quote(table),
            self.quote(date_column)
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;

        Ok(count_to_u64(count))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}


#[cfg(test)]
mod container_tests {
    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::*;
    use crate::db::tests::harness::postgres::create_isolated_postgres_pool;

    async fn store_with_events() -> PostgresTables {
        let pool = create_isolated_postgres_pool().await;
        sqlx::query(
            r#"
            CREATE TABLE events (
                id BIGSERIAL PRIMARY KEY,
                kind VARCHAR(20) NOT NULL,
                amount NUMERIC(10, 2),
                payload JSONB,
                occurred_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        PostgresTables::new(pool)
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn test_definition_synthesized_from_catalog() {
        let store = store_with_events().await;

        assert!(store.table_exists("events").await.unwrap());
        assert!(!store.table_exists("missing").await.unwrap());
        assert_eq!(store.primary_key("events").await.unwrap(), "id");

        let ddl = store.table_definition("events").await.unwrap();
        assert!(ddl.starts_with("CREATE TABLE \"events\" ("));
        assert!(ddl.contains("\"kind\" character varying(20) NOT NULL"));
        assert!(ddl.contains("\"amount\" numeric(10,2)"));
        assert!(ddl.contains("PRIMARY KEY (\"id\")"));
        assert!(!ddl.contains("nextval"));

        let renamed = store.rename_definition(&ddl, "archive_events").unwrap();
        store.create_table(&renamed).await.unwrap();
        store.add_bookkeeping_columns("archive_events").await.unwrap();
        // IF NOT EXISTS makes a second pass harmless
        store.add_bookkeeping_columns("archive_events").await.unwrap();

        let columns = store.columns("archive_events").await.unwrap();
        assert_eq!(
            columns,
            vec![
                "id",
                "kind",
                "amount",
                "payload",
                "occurred_at",
                ARCHIVED_AT_COLUMN,
                ARCHIVED_BY_COLUMN
            ]
        );
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn test_move_and_purge_rows() {
        let store = store_with_events().await;
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        for i in 0..3 {
            sqlx::query(
                "INSERT INTO events (kind, amount, payload, occurred_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(format!("kind-{i}"))
            .bind(if i == 0 { None } else { Some(Decimal::new(1050, 2)) })
            .bind(serde_json::json!({ "i": i }))
            .bind(old)
            .execute(&store.pool)
            .await
            .unwrap();
        }
        sqlx::query("INSERT INTO events (kind, occurred_at) VALUES ('fresh', NOW())")
            .execute(&store.pool)
            .await
            .unwrap();

        let ddl = store.table_definition("events").await.unwrap();
        store
            .create_table(&store.rename_definition(&ddl, "archive_events").unwrap())
            .await
            .unwrap();

        let cutoff = Utc::now() - ChronoDuration::days(30);
        let batch = store
            .select_batch("events", "occurred_at", cutoff, 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.rows[0][2], SqlValue::Null);
        assert_eq!(batch.rows[1][2], SqlValue::Decimal(Decimal::new(1050, 2)));
        assert_eq!(batch.rows[0][4], SqlValue::TimestampTz(old));

        assert_eq!(
            store
                .insert_batch("archive_events", "id", &batch)
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            store
                .insert_batch("archive_events", "id", &batch)
                .await
                .unwrap(),
            0
        );

        let keys = batch.key_values("id").unwrap();
        assert_eq!(store.delete_keys("events", "id", &keys).await.unwrap(), 3);
        assert_eq!(
            store
                .count_before("events", "occurred_at", cutoff)
                .await
                .unwrap(),
            0
        );

        let mut purged = 0;
        loop {
            let deleted = store
                .delete_before("archive_events", "occurred_at", cutoff, 2)
                .await
                .unwrap();
            if deleted == 0 {
                break;
            }
            purged += deleted;
        }
        assert_eq!(purged, 3);
    }
}
