mod common;
mod error;
#[cfg(feature = "database-postgres")]
pub mod postgres;
pub mod repos;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

#[cfg(all(test, any(feature = "database-sqlite", feature = "database-postgres")))]
pub mod tests;

use std::{sync::Arc, time::Duration};

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::{
    config::DatabaseConfig,
    models::{ConnectionDescriptor, DatabaseFamily},
};

/// Cached repository trait objects, created once at startup.
struct CachedRepos {
    policies: Arc<dyn PolicyRepo>,
    executions: Arc<dyn ExecutionRepo>,
}

enum PoolStorage {
    #[cfg(feature = "database-sqlite")]
    Sqlite(sqlx::SqlitePool),
    #[cfg(feature = "database-postgres")]
    Postgres(sqlx::PgPool),
    #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
    _None(std::convert::Infallible),
}

/// Orchestrator store: retention policies and job execution records.
///
/// Backed by SQLite or PostgreSQL. Repositories are cached at construction
/// time to avoid allocation on each access.
pub struct DbPool {
    inner: PoolStorage,
    repos: CachedRepos,
}

impl DbPool {
    /// Create a DbPool from an existing SQLite pool.
    /// Primarily useful for testing.
    #[cfg(feature = "database-sqlite")]
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        let repos = CachedRepos {
            policies: Arc::new(sqlite::SqlitePolicyRepo::new(pool.clone())),
            executions: Arc::new(sqlite::SqliteExecutionRepo::new(pool.clone())),
        };
        DbPool {
            inner: PoolStorage::Sqlite(pool),
            repos,
        }
    }

    /// Create a DbPool from an existing PostgreSQL pool.
    /// Primarily useful for testing.
    #[cfg(feature = "database-postgres")]
    pub fn from_postgres(pool: sqlx::PgPool) -> Self {
        let repos = CachedRepos {
            policies: Arc::new(postgres::PostgresPolicyRepo::new(pool.clone())),
            executions: Arc::new(postgres::PostgresExecutionRepo::new(pool.clone())),
        };
        DbPool {
            inner: PoolStorage::Postgres(pool),
            repos,
        }
    }

    /// Create a database pool from configuration
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            DatabaseConfig::None => Err(DbError::NotConfigured),
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(cfg) => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect_with(
                        sqlx::sqlite::SqliteConnectOptions::new()
                            .filename(&cfg.path)
                            .create_if_missing(cfg.create_if_missing)
                            .journal_mode(if cfg.wal_mode {
                                sqlx::sqlite::SqliteJournalMode::Wal
                            } else {
                                sqlx::sqlite::SqliteJournalMode::Delete
                            })
                            .busy_timeout(Duration::from_millis(cfg.busy_timeout_ms)),
                    )
                    .await?;

                Ok(Self::from_sqlite(pool))
            }
            #[cfg(feature = "database-postgres")]
            DatabaseConfig::Postgres(cfg) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .min_connections(cfg.min_connections)
                    .max_connections(cfg.max_connections)
                    .acquire_timeout(Duration::from_secs(cfg.connect_timeout_secs))
                    .idle_timeout(Duration::from_secs(cfg.idle_timeout_secs))
                    .connect(&cfg.url)
                    .await?;

                Ok(Self::from_postgres(pool))
            }
        }
    }

    /// Connect to the orchestrator store described by a connection descriptor.
    ///
    /// Used by worker units, which receive the orchestrator location through
    /// their environment rather than a config file. A small pool is enough
    /// for the single terminal write a unit performs.
    pub async fn from_descriptor(
        descriptor: &ConnectionDescriptor,
        connect_timeout: Duration,
    ) -> DbResult<Self> {
        match descriptor.family {
            #[cfg(feature = "database-sqlite")]
            DatabaseFamily::Sqlite => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(connect_timeout)
                    .connect_with(
                        sqlx::sqlite::SqliteConnectOptions::new()
                            .filename(&descriptor.database)
                            .busy_timeout(Duration::from_secs(5)),
                    )
                    .await?;
                Ok(Self::from_sqlite(pool))
            }
            #[cfg(feature = "database-postgres")]
            DatabaseFamily::Postgres => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(connect_timeout)
                    .connect_with(
                        sqlx::postgres::PgConnectOptions::new()
                            .host(&descriptor.host)
                            .port(descriptor.port)
                            .database(&descriptor.database)
                            .username(&descriptor.user)
                            .password(&descriptor.password),
                    )
                    .await?;
                Ok(Self::from_postgres(pool))
            }
            other => Err(DbError::Unsupported(format!(
                "{} (orchestrator store must be {} or {})",
                other,
                DatabaseFamily::Sqlite,
                DatabaseFamily::Postgres
            ))),
        }
    }

    /// Run database migrations using sqlx's migration runner
    /// This automatically creates and manages a _sqlx_migrations table
    pub async fn run_migrations(&self) -> DbResult<()> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                tracing::info!("Running SQLite migrations");
                sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
                tracing::info!("SQLite migrations completed successfully");
                Ok(())
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pool) => {
                tracing::info!("Running PostgreSQL migrations");
                sqlx::migrate!("./migrations_sqlx/postgres").run(pool).await?;
                tracing::info!("PostgreSQL migrations completed successfully");
                Ok(())
            }
            #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
            PoolStorage::_None(infallible) => match *infallible {},
        }
    }

    /// Get retention policy repository
    pub fn policies(&self) -> Arc<dyn PolicyRepo> {
        Arc::clone(&self.repos.policies)
    }

    /// Get job execution repository
    pub fn executions(&self) -> Arc<dyn ExecutionRepo> {
        Arc::clone(&self.repos.executions)
    }

    /// Close the underlying pool, waiting for connections to be released.
    pub async fn close(&self) {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => pool.close().await,
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pool) => pool.close().await,
            #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
            PoolStorage::_None(infallible) => match *infallible {},
        }
    }
}
