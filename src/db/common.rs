//! Column conversions shared by the SQLite and PostgreSQL repositories.

use std::str::FromStr;

use crate::{
    db::error::{DbError, DbResult},
    models::{ConnectionDescriptor, DatabaseFamily},
};

/// Parse an enum column stored as text, returning a DbError on failure.
pub fn parse_enum<T>(value: &str) -> DbResult<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| DbError::Internal(format!("Invalid value in database: {}", e)))
}

/// Narrow an integer column, returning a DbError when it does not fit.
pub fn narrow<T, S>(column: &str, value: S) -> DbResult<T>
where
    T: TryFrom<S>,
    S: Copy + std::fmt::Display,
{
    T::try_from(value).map_err(|_| {
        DbError::Internal(format!(
            "Column {} holds out-of-range value {}",
            column, value
        ))
    })
}

/// Raw descriptor columns as read from `retention_policies`.
pub struct DescriptorColumns {
    pub family: String,
    pub host: String,
    pub port: i64,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl DescriptorColumns {
    pub fn into_descriptor(self, prefix: &str) -> DbResult<ConnectionDescriptor> {
        let family: DatabaseFamily = parse_enum(&self.family)?;
        Ok(ConnectionDescriptor {
            family,
            host: self.host,
            port: narrow(&format!("{prefix}_port"), self.port)?,
            database: self.database,
            user: self.user,
            password: self.password,
        })
    }
}

/// Clamp an engine counter into a BIGINT column.
pub fn counter(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
