use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Column as _, MySqlPool, Row, TypeInfo, ValueRef,
    mysql::{MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlRow},
    query::Query,
};

use super::{
    ARCHIVED_AT_COLUMN, ARCHIVED_BY_COLUMN, Column, RowBatch, SchemaCloner, SqlValue, TableError,
    TableResult, TableStore, check_identifier, count_to_u64, question_marks,
};
use crate::models::{ARCHIVED_BY_TAG, ConnectionDescriptor, DatabaseFamily};

type MySqlQuery<'q> = Query<'q, sqlx::MySql, MySqlArguments>;

/// MySQL / MariaDB table store.
pub struct MysqlTables {
    pool: MySqlPool,
}

impl MysqlTables {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        descriptor: &ConnectionDescriptor,
        connect_timeout: Duration,
    ) -> TableResult<Self> {
        let options = MySqlConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port)
            .database(&descriptor.database)
            .username(&descriptor.user)
            .password(&descriptor.password)
            .charset("utf8mb4");

        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self::new(pool))
    }

    fn decode_row(row: &MySqlRow) -> TableResult<Vec<SqlValue>> {
        (0..row.len())
            .map(|i| {
                if row.try_get_raw(i)?.is_null() {
                    return Ok(SqlValue::Null);
                }
                let column = row.column(i);
                let type_name = column.type_info().name().to_ascii_uppercase();

                // Integer widths vary per column; the binary protocol decoder
                // reads any width into the 64-bit target.
                let value = match type_name.as_str() {
                    t if t.ends_with("UNSIGNED") => {
                        SqlValue::UnsignedBigInt(row.try_get_unchecked(i)?)
                    }
                    "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT"
                    | "YEAR" => SqlValue::BigInt(row.try_get_unchecked(i)?),
                    "FLOAT" => SqlValue::Real(row.try_get_unchecked(i)?),
                    "DOUBLE" => SqlValue::Double(row.try_get_unchecked(i)?),
                    "DECIMAL" => SqlValue::Decimal(row.try_get_unchecked(i)?),
                    "DATE" => SqlValue::Date(row.try_get_unchecked(i)?),
                    "TIME" => SqlValue::Time(row.try_get_unchecked(i)?),
                    "DATETIME" | "TIMESTAMP" => SqlValue::DateTime(row.try_get_unchecked(i)?),
                    "JSON" => SqlValue::Json(row.try_get_unchecked(i)?),
                    "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT"
                    | "ENUM" | "SET" => SqlValue::Text(row.try_get_unchecked(i)?),
                    "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB"
                    | "BIT" => SqlValue::Bytes(row.try_get_unchecked(i)?),
                    _ => {
                        return Err(TableError::UnsupportedType {
                            column: column.name().to_string(),
                            type_name,
                        });
                    }
                };
                Ok(value)
            })
            .collect()
    }

    fn bind_value<'q>(query: MySqlQuery<'q>, value: &SqlValue) -> MySqlQuery<'q> {
        match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::SmallInt(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::BigInt(v) => query.bind(*v),
            SqlValue::UnsignedBigInt(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Double(v) => query.bind(*v),
            SqlValue::Decimal(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Bytes(v) => query.bind(v.clone()),
            SqlValue::Date(v) => query.bind(*v),
            SqlValue::Time(v) => query.bind(*v),
            SqlValue::DateTime(v) => query.bind(*v),
            // DATETIME/TIMESTAMP columns carry no zone; the session runs in UTC.
            SqlValue::TimestampTz(v) => query.bind(v.naive_utc()),
            SqlValue::Uuid(v) => query.bind(v.hyphenated().to_string()),
            SqlValue::Json(v) => query.bind(sqlx::types::Json(v.clone())),
        }
    }
}

/// Drop `FOREIGN KEY` constraints from a `SHOW CREATE TABLE` statement.
///
/// Referenced tables do not exist in the archive database, and archived rows
/// must not cascade with the live ones.
fn strip_foreign_keys(ddl: &str) -> String {
    let mut kept: Vec<&str> = ddl
        .lines()
        .filter(|line| !line.to_ascii_uppercase().contains("FOREIGN KEY"))
        .collect();

    // The last definition before the closing `)` must not end with a comma.
    if let Some(close) = kept.iter().rposition(|line| line.trim_start().starts_with(')'))
        && close > 0
    {
        let prev = kept[close - 1].trim_end();
        if let Some(stripped) = prev.strip_suffix(',') {
            kept[close - 1] = stripped;
        }
    }

    kept.join("\n")
}

#[async_trait]
impl SchemaCloner for MysqlTables {
    fn quote(&self, ident: &str) -> String {
        format!("`{}`", ident)
    }

    async fn table_definition(&self, table: &str) -> TableResult<String> {
        check_identifier(table)?;

        let row = sqlx::query(&format!("SHOW CREATE TABLE {}", self.quote(table)))
            .fetch_one(&self.pool)
            .await?;
        // Columns: Table, Create Table
        let ddl: String = row.try_get_unchecked(1)?;

        Ok(strip_foreign_keys(&ddl))
    }

    async fn create_table(&self, ddl: &str) -> TableResult<()> {
        sqlx::query(ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn add_bookkeeping_columns(&self, table: &str) -> TableResult<()> {
        check_identifier(table)?;

        sqlx::query(&format!(
            "ALTER TABLE {} \
             ADD COLUMN {ARCHIVED_AT_COLUMN} TIMESTAMP DEFAULT CURRENT_TIMESTAMP, \
             ADD COLUMN {ARCHIVED_BY_COLUMN} VARCHAR(50) DEFAULT '{ARCHIVED_BY_TAG}'",
            self.quote(table)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for MysqlTables {
    fn family(&self) -> DatabaseFamily {
        DatabaseFamily::Mysql
    }

    async fn table_exists(&self, table: &str) -> TableResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM information_schema.tables
            WHERE table_schema = DATABASE() AND table_name = ?
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn primary_key(&self, table: &str) -> TableResult<String> {
        let rows = sqlx::query(
            r#"
            SELECT COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        // information_schema text columns come back as VARCHAR or VARBINARY
        // depending on server version; skip the type check.
        let mut keys = rows
            .iter()
            .map(|row| row.try_get_unchecked::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?;

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
        let rows = sqlx::query(
            r#"
            SELECT COLUMN_NAME FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| row.try_get_unchecked::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?)
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
            "SELECT * FROM {} WHERE {} < ? LIMIT ?",
            self.quote(table),
            self.quote(date_column)
        );
        let rows = sqlx::query(&query)
            .bind(cutoff.naive_utc())
            .bind(limit)
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

        let column_list = batch
            .columns
            .iter()
            .map(|c| self.quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let key = self.quote(key_column);
        // A no-op update on duplicate keys reports 0 affected rows.
        let statement = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {key} = {key}",
            self.quote(table),
            column_list,
            question_marks(batch.columns.len())
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
            question_marks(keys.len())
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

        let statement = format!(
            "DELETE FROM {} WHERE {} < ? LIMIT ?",
            self.quote(table),
            self.quote(date_column)
        );

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&statement)
            .bind(cutoff.naive_utc())
            .bind(limit)
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
            "SELECT COUNT(*) FROM {} WHERE {} < ?",
            self.quote(table),
            self.quote(date_column)
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(cutoff.naive_utc())
            .fetch_one(&self.pool)
            .await?;

        Ok(count_to_u64(count))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_foreign_keys() {
        let ddl = "CREATE TABLE `orders` (\n  `id` bigint NOT NULL,\n  `customer_id` bigint NOT NULL,\n  PRIMARY KEY (`id`),\n  KEY `fk_customer` (`customer_id`),\n  CONSTRAINT `fk_customer` FOREIGN KEY (`customer_id`) REFERENCES `customers` (`id`)\n) ENGINE=InnoDB";

        let stripped = strip_foreign_keys(ddl);

        assert!(!stripped.contains("FOREIGN KEY"));
        assert!(stripped.contains("  KEY `fk_customer` (`customer_id`)\n) ENGINE=InnoDB"));
    }

    #[test]
    fn test_strip_foreign_keys_untouched_without_constraints() {
        let ddl = "CREATE TABLE `t` (\n  `id` int NOT NULL,\n  PRIMARY KEY (`id`)\n) ENGINE=InnoDB";
        assert_eq!(strip_foreign_keys(ddl), ddl);
    }
}

#[cfg(all(
    test,
    any(feature = "database-sqlite", feature = "database-postgres")
))]
mod container_tests {
    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::*;
    use crate::db::tests::harness::mysql::create_mysql_container;

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn test_mysql_clone_and_move() {
        let (descriptor, _container) = create_mysql_container().await;
        let store = MysqlTables::connect(&descriptor, Duration::from_secs(30))
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE orders (id BIGINT PRIMARY KEY, qty INT UNSIGNED, note VARCHAR(20), created_at DATETIME NOT NULL)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        assert_eq!(store.primary_key("orders").await.unwrap(), "id");
        assert_eq!(
            store.columns("orders").await.unwrap(),
            vec!["id", "qty", "note", "created_at"]
        );

        let ddl = store.table_definition("orders").await.unwrap();
        let renamed = store.rename_definition(&ddl, "archive_orders").unwrap();
        store.create_table(&renamed).await.unwrap();
        store.add_bookkeeping_columns("archive_orders").await.unwrap();
        assert!(store.table_exists("archive_orders").await.unwrap());

        let batch = RowBatch {
            columns: vec![
                Column::new("id", "BIGINT"),
                Column::new("qty", "INT UNSIGNED"),
                Column::new("note", "VARCHAR"),
                Column::new("created_at", "DATETIME"),
            ],
            rows: vec![vec![
                SqlValue::BigInt(1),
                SqlValue::UnsignedBigInt(4_000_000_000),
                SqlValue::Null,
                SqlValue::DateTime(
                    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
                        .unwrap()
                        .naive_utc(),
                ),
            ]],
        };
        assert_eq!(store.insert_batch("orders", "id", &batch).await.unwrap(), 1);
        // Duplicate key is skipped
        assert_eq!(store.insert_batch("orders", "id", &batch).await.unwrap(), 0);

        let cutoff = Utc::now() - ChronoDuration::days(30);
        let selected = store
            .select_batch("orders", "created_at", cutoff, 10)
            .await
            .unwrap();
        assert_eq!(selected.rows, batch.rows);

        let moved = store
            .insert_batch(
                "archive_orders",
                "id",
                &selected.clone().with_bookkeeping(Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(moved, 1);
        let keys = selected.key_values("id").unwrap();
        assert_eq!(store.delete_keys("orders", "id", &keys).await.unwrap(), 1);
        assert_eq!(
            store
                .count_before("archive_orders", "created_at", cutoff)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .delete_before("archive_orders", "created_at", cutoff, 10)
                .await
                .unwrap(),
            1
        );

        store.close().await;
    }
}
