//! Error types for the job engine.

use std::sync::Arc;

use crate::jobs::types::{JobId, JobStatus};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by a job or by the engine while driving one.
///
/// Cloneable so that every waiter on a job's result receives the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job failed: {0:#}")]
    Failed(Arc<anyhow::Error>),

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} has already been started")]
    AlreadyStarted { id: JobId },
}

impl JobError {
    /// True for a terminal cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The captured work-function fault, if this is one.
    pub fn fault(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(Arc::new(err.into()))
    }
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open job store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while rehydrating a persisted job.
#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("No worker registered for job type {job_type}")]
    UnknownJobType { job_type: String },

    #[error("Invalid payload for job {id} ({job_type}): {reason}")]
    InvalidPayload {
        id: JobId,
        job_type: String,
        reason: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load() -> Result<(), RestartError> {
        Err(StoreError::Query("load_unfinished: disk I/O error".into()))?;
        Ok(())
    }

    #[test]
    fn store_failure_surfaces_as_restart_error() {
        let err = load().unwrap_err();
        assert!(matches!(err, RestartError::Store(StoreError::Query(_))));
        assert_eq!(
            err.to_string(),
            "Store error: Query failed: load_unfinished: disk I/O error"
        );
    }

    #[test]
    fn io_error_becomes_job_fault() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "source.bsa missing");
        let err = JobError::from(io);
        assert!(!err.is_cancelled());
        assert!(err.fault().unwrap().to_string().contains("source.bsa missing"));
    }
}
