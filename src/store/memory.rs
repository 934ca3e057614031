//! In-process store, used when no database path is configured and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::jobs::types::JobId;
use crate::store::record::PersistedJobState;
use crate::store::traits::JobStateStore;

#[derive(Default)]
pub struct InMemoryJobStore {
    records: RwLock<HashMap<JobId, PersistedJobState>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobStateStore for InMemoryJobStore {
    async fn save(&self, state: &PersistedJobState) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(state.job_id, state.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<PersistedJobState>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn load_unfinished(&self) -> Result<Vec<PersistedJobState>, StoreError> {
        let mut unfinished: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.status.is_resumable())
            .cloned()
            .collect();
        unfinished.sort_by_key(|record| record.updated_at);
        Ok(unfinished)
    }
}
