use async_trait::async_trait;

use crate::{
    db::error::DbResult,
    models::{CreateRetentionPolicy, RetentionPolicy},
};

/// Retention policy storage.
///
/// Policies are owned by the configuration service; the scheduler only reads
/// them. `create` exists for provisioning and tests.
#[async_trait]
pub trait PolicyRepo: Send + Sync {
    /// Insert a policy. Input is expected to be validated already.
    async fn create(&self, input: CreateRetentionPolicy) -> DbResult<RetentionPolicy>;

    /// Get a policy by its ID.
    async fn get(&self, id: i64) -> DbResult<Option<RetentionPolicy>>;

    /// List enabled policies, ordered by ID.
    async fn list_enabled(&self) -> DbResult<Vec<RetentionPolicy>>;
}
