//! Workers — per-job-type factories that rehydrate persisted jobs.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::RestartError;
use crate::jobs::context::{Job, JobDefinitionWithStart};
use crate::jobs::monitor::JobMonitor;
use crate::store::{PersistedJobState, PersistentJob};

/// Rebuilds and starts a runnable job from its persisted record.
#[async_trait]
pub trait JobWorker: Send + Sync {
    /// The `job_type` tag this worker handles.
    fn job_type(&self) -> &str;

    /// Reconstruct the job under `record.job_id` and start it on `monitor`.
    async fn load_job(
        &self,
        monitor: &Arc<JobMonitor>,
        record: &PersistedJobState,
    ) -> Result<Arc<dyn Job>, RestartError>;
}

/// Worker for any persistent definition that carries its own work function.
pub struct DefinitionWorker<D> {
    _definition: PhantomData<fn() -> D>,
}

impl<D> DefinitionWorker<D> {
    pub fn new() -> Self {
        Self {
            _definition: PhantomData,
        }
    }
}

impl<D> Default for DefinitionWorker<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D> JobWorker for DefinitionWorker<D>
where
    D: PersistentJob + JobDefinitionWithStart,
{
    fn job_type(&self) -> &str {
        D::JOB_TYPE
    }

    async fn load_job(
        &self,
        monitor: &Arc<JobMonitor>,
        record: &PersistedJobState,
    ) -> Result<Arc<dyn Job>, RestartError> {
        let definition: D = record.decode()?;
        let task = monitor.resume_persistent(record, definition, |ctx| D::run(ctx))?;
        Ok(task.into_inner())
    }
}

/// Workers keyed by job type.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn JobWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. A second worker for the same tag replaces the first.
    pub fn register(&mut self, worker: Arc<dyn JobWorker>) {
        let job_type = worker.job_type().to_string();
        if self.workers.insert(job_type.clone(), worker).is_some() {
            warn!(job_type = %job_type, "Replacing previously registered worker");
        }
    }

    pub fn with(mut self, worker: Arc<dyn JobWorker>) -> Self {
        self.register(worker);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<&Arc<dyn JobWorker>> {
        self.workers.get(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.workers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    use crate::error::JobError;
    use crate::jobs::context::{JobContext, JobDefinition};

    #[derive(Serialize, Deserialize)]
    struct Install {
        archive: String,
    }

    impl JobDefinition for Install {
        type Output = String;
    }

    impl PersistentJob for Install {
        const JOB_TYPE: &'static str = "install";
    }

    #[async_trait]
    impl JobDefinitionWithStart for Install {
        async fn run(ctx: Arc<JobContext<Self>>) -> Result<String, JobError> {
            Ok(ctx.definition().archive.clone())
        }
    }

    #[test]
    fn registry_looks_up_by_tag() {
        let registry =
            WorkerRegistry::new().with(Arc::new(DefinitionWorker::<Install>::new()));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("install").is_some());
        assert!(registry.get("download").is_none());
        assert_eq!(registry.job_types(), vec!["install"]);
    }

    #[tokio::test]
    async fn definition_worker_rehydrates_with_persisted_id() {
        let monitor = JobMonitor::new(&crate::config::EngineConfig::default());
        let record = PersistedJobState::new(
            crate::jobs::types::JobId::new(),
            "install",
            crate::jobs::types::JobStatus::Running,
            serde_json::json!({ "archive": "skyui.7z" }),
        );
        let worker = DefinitionWorker::<Install>::new();
        let job = worker.load_job(&monitor, &record).await.unwrap();
        assert_eq!(job.id(), record.job_id);

        let ctx = job.as_any().downcast::<JobContext<Install>>().ok().unwrap();
        assert_eq!(ctx.wait_for_result().await.unwrap(), "skyui.7z");
    }
}
