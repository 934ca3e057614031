//! Persisted job records.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RestartError, StoreError};
use crate::jobs::context::JobDefinition;
use crate::jobs::types::{JobId, JobStatus};

/// One row of durable job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedJobState {
    pub job_id: JobId,
    /// Tag selecting the worker that can rehydrate this job.
    pub job_type: String,
    pub status: JobStatus,
    /// The serialized definition.
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl PersistedJobState {
    pub fn new(
        job_id: JobId,
        job_type: impl Into<String>,
        status: JobStatus,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            status,
            payload,
            updated_at: Utc::now(),
        }
    }

    /// Snapshot `definition` under its job type tag.
    pub fn for_job<D: PersistentJob>(
        job_id: JobId,
        definition: &D,
        status: JobStatus,
    ) -> Result<Self, StoreError> {
        let payload = serde_json::to_value(definition)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", D::JOB_TYPE)))?;
        Ok(Self::new(job_id, D::JOB_TYPE, status, payload))
    }

    /// Same record with a new status and a fresh timestamp.
    pub fn with_status(&self, status: JobStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Deserialize the payload back into a definition.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RestartError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| RestartError::InvalidPayload {
            id: self.job_id,
            job_type: self.job_type.clone(),
            reason: e.to_string(),
        })
    }
}

/// A definition that can be written to and rebuilt from a [`PersistedJobState`].
pub trait PersistentJob: JobDefinition + Serialize + DeserializeOwned {
    /// Stable tag stored with every record; must be unique per worker.
    const JOB_TYPE: &'static str;
}
