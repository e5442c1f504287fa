use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Column as _, Row, SqlitePool, TypeInfo, ValueRef,
    query::Query,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};

use super::{
    ARCHIVED_AT_COLUMN, ARCHIVED_BY_COLUMN, Column, RowBatch, SchemaCloner, SqlValue, TableError,
    TableResult, TableStore, check_identifier, count_to_u64, question_marks,
};
use crate::models::{ARCHIVED_BY_TAG, ConnectionDescriptor, DatabaseFamily};

type SqliteQuery<'q> = Query<'q, sqlx::Sqlite, SqliteArguments<'q>>;

/// SQLite table store. `database` in the descriptor is the file path.
pub struct SqliteTables {
    pool: SqlitePool,
}

impl SqliteTables {
    /// Wrap an existing pool. Primarily useful for testing.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        descriptor: &ConnectionDescriptor,
        connect_timeout: Duration,
    ) -> TableResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(connect_timeout)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&descriptor.database)
                    .busy_timeout(Duration::from_secs(5)),
            )
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self::new(pool))
    }

    fn decode_row(row: &SqliteRow) -> TableResult<Vec<SqlValue>> {
        (0..row.len())
            .map(|i| {
                let raw = row.try_get_raw(i)?;
                if raw.is_null() {
                    return Ok(SqlValue::Null);
                }
                // Dispatch on the stored value's class; declared column types
                // are only affinities in SQLite.
                let storage = raw.type_info().name().to_string();
                let value = match storage.as_str() {
                    "INTEGER" => SqlValue::BigInt(row.try_get_unchecked(i)?),
                    "REAL" => SqlValue::Double(row.try_get_unchecked(i)?),
                    "TEXT" => SqlValue::Text(row.try_get_unchecked(i)?),
                    "BLOB" => SqlValue::Bytes(row.try_get_unchecked(i)?),
                    _ => {
                        return Err(TableError::UnsupportedType {
                            column: row.column(i).name().to_string(),
                            type_name: storage,
                        });
                    }
                };
                Ok(value)
            })
            .collect()
    }

    /// Fail when `date_column` holds values `datetime()` cannot read; such
    /// rows never match a cutoff and would otherwise be skipped silently.
    async fn check_dates_readable(&self, table: &str, date_column: &str) -> TableResult<()> {
        let column = self.quote(date_column);
        let query = format!(
            "SELECT 1 FROM {} WHERE {column} IS NOT NULL AND {} IS NULL LIMIT 1",
            self.quote(table),
            date_expr(&column)
        );
        let unreadable = sqlx::query(&query).fetch_optional(&self.pool).await?;
        if unreadable.is_some() {
            return Err(TableError::Schema(format!(
                "column {date_column} of table {table} holds values that are not dates \
                 (expected ISO-8601 text or Unix seconds)"
            )));
        }
        Ok(())
    }

    fn bind_value<'q>(query: SqliteQuery<'q>, value: &SqlValue) -> SqliteQuery<'q> {
        match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::SmallInt(v) => query.bind(i64::from(*v)),
            SqlValue::Int(v) => query.bind(i64::from(*v)),
            SqlValue::BigInt(v) => query.bind(*v),
            // SQLite integers are signed 64-bit; larger values are kept as text.
            SqlValue::UnsignedBigInt(v) => match i64::try_from(*v) {
                Ok(v) => query.bind(v),
                Err(_) => query.bind(v.to_string()),
            },
            SqlValue::Real(v) => query.bind(f64::from(*v)),
            SqlValue::Double(v) => query.bind(*v),
            SqlValue::Decimal(v) => query.bind(v.to_string()),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Bytes(v) => query.bind(v.clone()),
            SqlValue::Date(v) => query.bind(*v),
            SqlValue::Time(v) => query.bind(*v),
            SqlValue::DateTime(v) => query.bind(*v),
            SqlValue::TimestampTz(v) => query.bind(*v),
            SqlValue::Uuid(v) => query.bind(v.hyphenated().to_string()),
            SqlValue::Json(v) => query.bind(v.to_string()),
        }
    }
}

/// Cutoffs are compared through `datetime()` so ISO-8601 text with or without
/// a `T` separator, fractional seconds, or an offset all order correctly.
fn cutoff_text(cutoff: DateTime<Utc>) -> String {
    cutoff.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// A date column normalized through `datetime()`. Integer and real values
/// are Unix seconds; anything else is parsed as date text.
fn date_expr(quoted_column: &str) -> String {
    format!(
        "(CASE WHEN typeof({c}) IN ('integer', 'real') \
         THEN datetime({c}, 'unixepoch') ELSE datetime({c}) END)",
        c = quoted_column
    )
}

/// Lexical token of a table definition, as a byte span into it.
#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
    word: bool,
}

/// A tokenized `CREATE TABLE` statement. Comments are dropped; quoted
/// names and literals are single non-word tokens.
struct Lexed<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
}

impl<'a> Lexed<'a> {
    fn new(sql: &'a str) -> Self {
        let bytes = sql.as_bytes();
        let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80;
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            let start = i;
            let b = bytes[i];
            match b {
                _ if b.is_ascii_whitespace() => i += 1,
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i = sql[i + 2..]
                        .find("*/")
                        .map_or(bytes.len(), |offset| i + 2 + offset + 2);
                }
                b'\'' | b'"' | b'`' | b'[' => {
                    let close = if b == b'[' { b']' } else { b };
                    i += 1;
                    while i < bytes.len() {
                        if bytes[i] != close {
                            i += 1;
                        } else if close != b']' && bytes.get(i + 1) == Some(&close) {
                            i += 2;
                        } else {
                            i += 1;
                            break;
                        }
                    }
                    tokens.push(Token { start, end: i, word: false });
                }
                _ if is_word(b) => {
                    while i < bytes.len() && is_word(bytes[i]) {
                        i += 1;
                    }
                    tokens.push(Token { start, end: i, word: true });
                }
                _ => {
                    i += 1;
                    tokens.push(Token { start, end: i, word: false });
                }
            }
        }
        Self { sql, tokens }
    }

    fn text(&self, i: usize) -> &'a str {
        let t = self.tokens[i];
        &self.sql[t.start..t.end]
    }

    fn is(&self, i: usize, end: usize, keyword: &str) -> bool {
        i < end && self.tokens[i].word && self.text(i).eq_ignore_ascii_case(keyword)
    }

    /// Index just past the group opened by the `(` at `open`.
    fn group_end(&self, open: usize, end: usize) -> usize {
        let mut depth = 0usize;
        for i in open..end {
            match self.text(i) {
                "(" => depth += 1,
                ")" => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return i + 1;
                    }
                }
                _ => {}
            }
        }
        end
    }

    /// Index just past the foreign-key clause starting at `REFERENCES`.
    fn references_end(&self, at: usize, end: usize) -> usize {
        // REFERENCES [schema.]table [(columns)]
        let mut j = at + 2;
        if j < end && self.text(j) == "." {
            j += 2;
        }
        if j < end && self.text(j) == "(" {
            j = self.group_end(j, end);
        }
        loop {
            if self.is(j, end, "ON") {
                j += 2;
                j += if self.is(j, end, "SET") || self.is(j, end, "NO") { 2 } else { 1 };
            } else if self.is(j, end, "MATCH") || self.is(j, end, "INITIALLY") {
                j += 2;
            } else if self.is(j, end, "NOT") && self.is(j + 1, end, "DEFERRABLE") {
                j += 2;
            } else if self.is(j, end, "DEFERRABLE") {
                j += 1;
            } else {
                break;
            }
        }
        j.min(end)
    }

    fn span(&self, first: usize, last: usize) -> (usize, usize) {
        (self.tokens[first].start, self.tokens[last].end)
    }
}

/// Remove foreign keys from a table definition: `FOREIGN KEY` table
/// constraints and `REFERENCES` column constraints. Archive tables live
/// apart from the tables the keys point at.
fn strip_foreign_keys(ddl: &str) -> String {
    let lexed = Lexed::new(ddl);
    let Some(open) = (0..lexed.tokens.len()).find(|&i| lexed.text(i) == "(") else {
        return ddl.to_string();
    };

    // Top-level definitions as token ranges, with the comma before each.
    let mut definitions: Vec<(usize, usize)> = Vec::new();
    let mut commas: Vec<usize> = Vec::new();
    let mut depth = 0usize;
    let mut start = open + 1;
    for i in open + 1..lexed.tokens.len() {
        match lexed.text(i) {
            "(" => depth += 1,
            ")" if depth == 0 => {
                definitions.push((start, i));
                break;
            }
            ")" => depth -= 1,
            "," if depth == 0 => {
                definitions.push((start, i));
                commas.push(i);
                start = i + 1;
            }
            _ => {}
        }
    }

    let mut removed: Vec<(usize, usize)> = Vec::new();
    for (k, &(a, b)) in definitions.iter().enumerate() {
        if a >= b {
            continue;
        }
        let table_constraint = lexed.is(a, b, "FOREIGN")
            || (lexed.is(a, b, "CONSTRAINT") && lexed.is(a + 2, b, "FOREIGN"));
        if table_constraint {
            if k > 0 {
                removed.push(lexed.span(commas[k - 1], b - 1));
            } else if let Some(&comma) = commas.first() {
                removed.push(lexed.span(a, comma));
            }
            continue;
        }

        let mut depth = 0usize;
        let mut i = a;
        while i < b {
            match lexed.text(i) {
                "(" => depth += 1,
                ")" => depth = depth.saturating_sub(1),
                _ => {}
            }
            if depth == 0 && lexed.is(i, b, "REFERENCES") {
                let first = if i >= a + 2 && lexed.is(i - 2, b, "CONSTRAINT") { i - 2 } else { i };
                let end = lexed.references_end(i, b);
                removed.push(lexed.span(first, end - 1));
                i = end;
                continue;
            }
            i += 1;
        }
    }

    let mut stripped = String::with_capacity(ddl.len());
    let mut copied = 0;
    for (from, to) in removed {
        stripped.push_str(&ddl[copied..from]);
        copied = to;
    }
    stripped.push_str(&ddl[copied..]);
    stripped
}

#[async_trait]
impl SchemaCloner for SqliteTables {
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident)
    }

    async fn table_definition(&self, table: &str) -> TableResult<String> {
        let sql: Option<String> =
            sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;

        sql.map(|sql| strip_foreign_keys(&sql))
            .ok_or_else(|| TableError::Schema(format!("table {} does not exist", table)))
    }

    async fn create_table(&self, ddl: &str) -> TableResult<()> {
        sqlx::query(ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn add_bookkeeping_columns(&self, table: &str) -> TableResult<()> {
        check_identifier(table)?;
        let table = self.quote(table);

        // SQLite only allows constant defaults on ADD COLUMN, so archived_at
        // is written explicitly by every insert.
        sqlx::query(&format!(
            "ALTER TABLE {table} ADD COLUMN {ARCHIVED_AT_COLUMN} TEXT"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "ALTER TABLE {table} ADD COLUMN {ARCHIVED_BY_COLUMN} TEXT DEFAULT '{ARCHIVED_BY_TAG}'"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for SqliteTables {
    fn family(&self) -> DatabaseFamily {
        DatabaseFamily::Sqlite
    }

    async fn table_exists(&self, table: &str) -> TableResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    async fn primary_key(&self, table: &str) -> TableResult<String> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;

        single_key(table, keys)
    }

    async fn columns(&self, table: &str) -> TableResult<Vec<String>> {
        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;
        Ok(columns)
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
            "SELECT * FROM {} WHERE {} < datetime(?) LIMIT ?",
            self.quote(table),
            date_expr(&self.quote(date_column))
        );
        let rows = sqlx::query(&query)
            .bind(cutoff_text(cutoff))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let Some(first) = rows.first() else {
            self.check_dates_readable(table, date_column).await?;
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
        _key_column: &str,
        batch: &RowBatch,
    ) -> TableResult<u64> {
        check_identifier(table)?;
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
        let statement = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
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

        let quoted = self.quote(table);
        let statement = format!(
            r#"
            DELETE FROM {quoted}
            WHERE rowid IN (
                SELECT rowid FROM {quoted}
                WHERE {} < datetime(?)
                LIMIT ?
            )
            "#,
            date_expr(&self.quote(date_column))
        );

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&statement)
            .bind(cutoff_text(cutoff))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if deleted == 0 {
            self.check_dates_readable(table, date_column).await?;
        }
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
            "SELECT COUNT(*) FROM {} WHERE {} < datetime(?)",
            self.quote(table),
            date_expr(&self.quote(date_column))
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(cutoff_text(cutoff))
            .fetch_one(&self.pool)
            .await?;

        Ok(count_to_u64(count))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn single_key(table: &str, mut keys: Vec<String>) -> TableResult<String> {
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
