//! File-backed SQLite fixtures for engine tests.
//!
//! Engines own and close their connections, so fixtures use database files
//! that outlive a run and are inspected through a separate pool.

use chrono::{Duration, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tempfile::TempDir;

use super::TableJob;
use crate::{db::DbPool, models::ConnectionDescriptor};

pub struct Fixture {
    dir: TempDir,
    pub source: ConnectionDescriptor,
    pub destination: ConnectionDescriptor,
    pub source_pool: SqlitePool,
    pub archive_pool: SqlitePool,
}

async fn open(path: &str) -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
        )
        .await
        .expect("Failed to open fixture database")
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source_path = dir.path().join("primary.db").display().to_string();
        let archive_path = dir.path().join("archive.db").display().to_string();

        let source_pool = open(&source_path).await;
        let archive_pool = open(&archive_path).await;

        sqlx::query(
            r#"
            CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                customer TEXT NOT NULL,
                total REAL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&source_pool)
        .await
        .expect("Failed to create orders table");

        Self {
            dir,
            source: ConnectionDescriptor::sqlite(source_path),
            destination: ConnectionDescriptor::sqlite(archive_path),
            source_pool,
            archive_pool,
        }
    }

    /// A migrated orchestrator store next to the fixture databases.
    pub async fn orchestrator(&self) -> (ConnectionDescriptor, DbPool) {
        let path = self.dir.path().join("das.db").display().to_string();
        let db = DbPool::from_sqlite(open(&path).await);
        db.run_migrations()
            .await
            .expect("Failed to migrate orchestrator store");
        (ConnectionDescriptor::sqlite(path), db)
    }

    pub fn job(&self, batch_size: u32) -> TableJob {
        TableJob {
            table_name: "orders".into(),
            date_column: "created_at".into(),
            archival_days: 30,
            deletion_days: 365,
            batch_size,
        }
    }

    /// Insert `count` orders aged `age_days`, with ids starting at `first_id`.
    pub async fn seed_orders(&self, first_id: i64, count: i64, age_days: i64) {
        let created_at = Utc::now() - Duration::days(age_days);
        let mut tx = self.source_pool.begin().await.unwrap();
        for id in first_id..first_id + count {
            sqlx::query("INSERT INTO orders (id, customer, total, created_at) VALUES (?, ?, ?, ?)")
                .bind(id)
                .bind(format!("customer-{id}"))
                .bind(id as f64 * 1.5)
                .bind(created_at)
                .execute(&mut *tx)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
    }

    pub async fn source_count(&self) -> i64 {
        count(&self.source_pool, "orders").await
    }

    pub async fn archive_count(&self) -> i64 {
        count(&self.archive_pool, "archive_orders").await
    }
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
        .fetch_one(pool)
        .await
        .unwrap()
}
