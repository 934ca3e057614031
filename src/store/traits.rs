//! `JobStateStore` trait — async interface for durable job state.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::jobs::types::JobId;
use crate::store::record::PersistedJobState;

/// Backend-agnostic storage for [`PersistedJobState`] records.
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Insert or replace the record for `state.job_id`.
    async fn save(&self, state: &PersistedJobState) -> Result<(), StoreError>;

    /// Get a record by job id.
    async fn get(&self, id: JobId) -> Result<Option<PersistedJobState>, StoreError>;

    /// Delete a record. Returns whether one existed.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;

    /// Every record whose status is resumable, oldest first.
    async fn load_unfinished(&self) -> Result<Vec<PersistedJobState>, StoreError>;
}
