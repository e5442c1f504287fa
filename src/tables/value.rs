use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;

use super::{TableError, TableResult};
use crate::models::ARCHIVED_BY_TAG;

/// Bookkeeping column holding when a row was archived.
pub const ARCHIVED_AT_COLUMN: &str = "archived_at";
/// Bookkeeping column holding which actor archived a row.
pub const ARCHIVED_BY_COLUMN: &str = "archived_by";

/// A single column value read from a table whose schema is only known at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    UnsignedBigInt(u64),
    Real(f32),
    Double(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Name and database-reported type of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Rows pulled from a source table in one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Values of `key_column` for every row, in row order.
    pub fn key_values(&self, key_column: &str) -> TableResult<Vec<SqlValue>> {
        let idx = self.column_index(key_column).ok_or_else(|| {
            TableError::Schema(format!("key column {} missing from batch", key_column))
        })?;

        self.rows
            .iter()
            .map(|row| match &row[idx] {
                SqlValue::Null => Err(TableError::Schema(format!(
                    "key column {} holds NULL",
                    key_column
                ))),
                value => Ok(value.clone()),
            })
            .collect()
    }

    /// Append the `archived_at`/`archived_by` columns with explicit values.
    pub fn with_bookkeeping(mut self, archived_at: DateTime<Utc>) -> Self {
        self.columns.push(Column::new(ARCHIVED_AT_COLUMN, "TIMESTAMPTZ"));
        self.columns.push(Column::new(ARCHIVED_BY_COLUMN, "TEXT"));
        for row in &mut self.rows {
            row.push(SqlValue::TimestampTz(archived_at));
            row.push(SqlValue::Text(ARCHIVED_BY_TAG.to_string()));
        }
        self
    }
}
