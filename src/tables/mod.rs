//! Access to the data-plane databases: the primary tables being archived and
//! the archive tables they are moved into.
//!
//! Table schemas are not known ahead of time, so rows travel as [`RowBatch`]es
//! of dynamically typed [`SqlValue`]s. Each database family implements
//! [`TableStore`] (row movement) and [`SchemaCloner`] (first-use table cloning).

#[cfg(feature = "database-mysql")]
mod mysql;
#[cfg(feature = "database-postgres")]
mod postgres;
#[cfg(feature = "database-sqlite")]
mod sqlite;
mod value;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(feature = "database-mysql")]
pub use mysql::MysqlTables;
#[cfg(feature = "database-postgres")]
pub use postgres::PostgresTables;
#[cfg(feature = "database-sqlite")]
pub use sqlite::SqliteTables;
use thiserror::Error;
pub use value::*;

use crate::models::{ConnectionDescriptor, DatabaseFamily, is_valid_identifier};

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Column {column} has unsupported type {type_name}")]
    UnsupportedType { column: String, type_name: String },

    #[error("{0}")]
    Schema(String),

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error(
        "Database type {family} is not compiled into this build (enable the '{}' feature)",
        .family.feature()
    )]
    NotCompiled { family: DatabaseFamily },
}

pub type TableResult<T> = Result<T, TableError>;

/// Clones a table's structure into another database of the same family.
#[async_trait]
pub trait SchemaCloner: Send + Sync {
    /// Quote an identifier for this family's SQL dialect.
    fn quote(&self, ident: &str) -> String;

    /// The `CREATE TABLE` statement describing `table`.
    async fn table_definition(&self, table: &str) -> TableResult<String>;

    /// Execute a `CREATE TABLE` statement.
    async fn create_table(&self, ddl: &str) -> TableResult<()>;

    /// Add the `archived_at`/`archived_by` columns to `table`.
    async fn add_bookkeeping_columns(&self, table: &str) -> TableResult<()>;

    /// Rewrite a table definition so it creates `new_name` instead.
    fn rename_definition(&self, ddl: &str, new_name: &str) -> TableResult<String> {
        rename_definition(ddl, &self.quote(new_name))
    }
}

/// Row-level access to one database.
#[async_trait]
pub trait TableStore: SchemaCloner {
    fn family(&self) -> DatabaseFamily;

    async fn table_exists(&self, table: &str) -> TableResult<bool>;

    /// The single primary key column of `table`.
    ///
    /// Tables without a primary key, or with a composite one, are rejected:
    /// moved rows are deleted from the source by key.
    async fn primary_key(&self, table: &str) -> TableResult<String>;

    /// Column names of `table`, in declaration order.
    async fn columns(&self, table: &str) -> TableResult<Vec<String>>;

    /// Up to `limit` rows of `table` with `date_column < cutoff`.
    async fn select_batch(
        &self,
        table: &str,
        date_column: &str,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> TableResult<RowBatch>;

    /// Insert every row of `batch` in one transaction, skipping rows whose
    /// primary key already exists. Returns the number of rows inserted.
    async fn insert_batch(&self, table: &str, key_column: &str, batch: &RowBatch)
    -> TableResult<u64>;

    /// Delete the rows whose `key_column` is in `keys`, in one transaction.
    async fn delete_keys(
        &self,
        table: &str,
        key_column: &str,
        keys: &[SqlValue],
    ) -> TableResult<u64>;

    /// Delete up to `limit` rows with `date_column < cutoff` in one transaction.
    async fn delete_before(
        &self,
        table: &str,
        date_column: &str,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> TableResult<u64>;

    /// Count rows with `date_column < cutoff`.
    async fn count_before(
        &self,
        table: &str,
        date_column: &str,
        cutoff: DateTime<Utc>,
    ) -> TableResult<u64>;

    /// Release every pooled connection.
    async fn close(&self);
}

/// Connect to the database a descriptor points at.
///
/// The connection is verified before returning, so an unreachable database
/// fails here rather than on the first batch.
pub async fn connect(
    descriptor: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> TableResult<Box<dyn TableStore>> {
    tracing::debug!(location = %descriptor.location(), "Connecting to data-plane database");

    match descriptor.family {
        #[cfg(feature = "database-mysql")]
        DatabaseFamily::Mysql => Ok(Box::new(
            MysqlTables::connect(descriptor, connect_timeout).await?,
        )),
        #[cfg(feature = "database-postgres")]
        DatabaseFamily::Postgres => Ok(Box::new(
            PostgresTables::connect(descriptor, connect_timeout).await?,
        )),
        #[cfg(feature = "database-sqlite")]
        DatabaseFamily::Sqlite => Ok(Box::new(
            SqliteTables::connect(descriptor, connect_timeout).await?,
        )),
        #[allow(unreachable_patterns)]
        family => {
            let _ = connect_timeout;
            Err(TableError::NotCompiled { family })
        }
    }
}

/// Reject identifiers that cannot be safely interpolated into SQL.
pub fn check_identifier(name: &str) -> TableResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(TableError::InvalidIdentifier(name.to_string()))
    }
}

/// Replace the table name in a `CREATE TABLE` header with `quoted_name`.
///
/// Everything from the first `(` on (columns, constraints, table options) is
/// kept verbatim.
fn rename_definition(ddl: &str, quoted_name: &str) -> TableResult<String> {
    let trimmed = ddl.trim_start();
    let header_end = trimmed
        .find('(')
        .ok_or_else(|| TableError::Schema("table definition has no column list".into()))?;

    let header = trimmed[..header_end].to_ascii_uppercase();
    if !header.trim_start().starts_with("CREATE TABLE")
        && !header.trim_start().starts_with("CREATE TEMPORARY TABLE")
    {
        return Err(TableError::Schema(format!(
            "unexpected table definition header: {}",
            trimmed[..header_end].trim()
        )));
    }

    Ok(format!("CREATE TABLE {} {}", quoted_name, &trimmed[header_end..]))
}

/// `?, ?, ?` for `n` positional parameters.
fn question_marks(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn count_to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}
