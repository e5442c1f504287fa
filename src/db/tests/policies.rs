//! Shared tests for PolicyRepo implementations

use crate::{
    db::repos::PolicyRepo,
    models::{ConnectionDescriptor, CreateRetentionPolicy, DatabaseFamily},
};

// ============================================================================
// Test Input Helpers
// ============================================================================

fn descriptor(database: &str) -> ConnectionDescriptor {
    ConnectionDescriptor {
        family: DatabaseFamily::Mysql,
        host: "mysql.internal".to_string(),
        port: 3306,
        database: database.to_string(),
        user: "archiver".to_string(),
        password: "s3cret".to_string(),
    }
}

pub fn create_policy_input(table: &str, enabled: bool) -> CreateRetentionPolicy {
    CreateRetentionPolicy {
        source: descriptor("shop"),
        destination: descriptor("shop_archive"),
        table_name: table.to_string(),
        date_column: "created_at".to_string(),
        archival_days: 180,
        deletion_days: 730,
        enabled,
    }
}

// ============================================================================
// Shared Tests
// ============================================================================

pub async fn test_create_and_get(repo: &dyn PolicyRepo) {
    let created = repo
        .create(create_policy_input("orders", true))
        .await
        .expect("Failed to create policy");

    assert_eq!(created.table_name, "orders");
    assert_eq!(created.archive_table(), "archive_orders");
    assert_eq!(created.archival_days, 180);
    assert_eq!(created.deletion_days, 730);
    assert!(created.enabled);
    assert!(created.updated_at.is_none());

    let fetched = repo
        .get(created.id)
        .await
        .expect("Failed to get policy")
        .expect("Policy should exist");

    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.source, descriptor("shop"));
    assert_eq!(fetched.destination, descriptor("shop_archive"));
    assert_eq!(fetched.destination.password, "s3cret");
}

pub async fn test_get_not_found(repo: &dyn PolicyRepo) {
    let result = repo.get(999_999).await.expect("Query should succeed");
    assert!(result.is_none());
}

pub async fn test_list_enabled_skips_disabled(repo: &dyn PolicyRepo) {
    let orders = repo
        .create(create_policy_input("orders", true))
        .await
        .unwrap();
    repo.create(create_policy_input("sessions", false))
        .await
        .unwrap();
    let events = repo
        .create(create_policy_input("events", true))
        .await
        .unwrap();

    let enabled = repo.list_enabled().await.expect("Failed to list policies");
    let ids: Vec<i64> = enabled.iter().map(|p| p.id).collect();

    assert_eq!(ids, vec![orders.id, events.id]);
}

pub async fn test_list_enabled_empty(repo: &dyn PolicyRepo) {
    let enabled = repo.list_enabled().await.expect("Failed to list policies");
    assert!(enabled.is_empty());
}

// ============================================================================
// SQLite Tests - Fast, in-memory
// ============================================================================

#[cfg(all(test, feature = "database-sqlite"))]
mod sqlite_tests {
    use crate::db::{
        sqlite::SqlitePolicyRepo,
        tests::harness::{create_sqlite_pool, run_sqlite_migrations},
    };

    macro_rules! sqlite_test {
        ($name:ident) => {
            #[tokio::test]
            async fn $name() {
                let pool = create_sqlite_pool().await;
                run_sqlite_migrations(&pool).await;
                let repo = SqlitePolicyRepo::new(pool);
                super::$name(&repo).await;
            }
        };
    }

    sqlite_test!(test_create_and_get);
    sqlite_test!(test_get_not_found);
    sqlite_test!(test_list_enabled_skips_disabled);
    sqlite_test!(test_list_enabled_empty);
}

// ============================================================================
// PostgreSQL Tests - Require Docker
// ============================================================================

#[cfg(all(test, feature = "database-postgres"))]
mod postgres_tests {
    use crate::db::{
        postgres::PostgresPolicyRepo,
        tests::harness::postgres::{create_isolated_postgres_pool, run_postgres_migrations},
    };

    macro_rules! postgres_test {
        ($name:ident) => {
            #[tokio::test]
            #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
            async fn $name() {
                let pool = create_isolated_postgres_pool().await;
                run_postgres_migrations(&pool).await;
                let repo = PostgresPolicyRepo::new(pool);
                super::$name(&repo).await;
            }
        };
    }

    postgres_test!(test_create_and_get);
    postgres_test!(test_get_not_found);
    postgres_test!(test_list_enabled_skips_disabled);
    postgres_test!(test_list_enabled_empty);
}
