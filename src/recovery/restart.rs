//! Restart protocol — resumes jobs a previous process left unfinished.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::error::RestartError;
use crate::jobs::monitor::JobMonitor;
use crate::jobs::types::JobId;
use crate::recovery::worker::WorkerRegistry;

/// Outcome of one restart run.
#[derive(Debug, Default)]
pub struct RestartReport {
    /// Jobs that were rehydrated and started.
    pub resumed: Vec<JobId>,
    /// Records that could not be resumed, with the reason.
    pub failed: Vec<(JobId, RestartError)>,
    /// Records skipped because their id was already seen or already running.
    pub skipped: usize,
}

impl RestartReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drives the restart protocol. The binary owns one and calls
/// [`restart`](Self::restart) before issuing new jobs.
pub struct JobRestarter {
    workers: WorkerRegistry,
    started: AtomicBool,
}

impl JobRestarter {
    pub fn new(workers: WorkerRegistry) -> Self {
        Self {
            workers,
            started: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// Resume every unfinished persisted job through its worker.
    ///
    /// Runs once; later calls log a warning and return an empty report.
    /// One record failing does not stop the others. Only a failure to read
    /// the store is returned as an error.
    pub async fn restart(&self, monitor: &Arc<JobMonitor>) -> Result<RestartReport, RestartError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Restart protocol already ran, ignoring");
            return Ok(RestartReport::default());
        }
        let Some(store) = monitor.store() else {
            warn!("No job store configured, nothing to restart");
            return Ok(RestartReport::default());
        };

        let records = store.load_unfinished().await?;
        info!(count = records.len(), "Restarting unfinished jobs");

        let mut report = RestartReport::default();
        let mut seen = HashSet::new();
        for record in records {
            if !seen.insert(record.job_id) || monitor.jobs().contains(record.job_id) {
                report.skipped += 1;
                continue;
            }

            let Some(worker) = self.workers.get(&record.job_type) else {
                error!(job_id = %record.job_id, job_type = %record.job_type, "No worker for persisted job");
                report.failed.push((
                    record.job_id,
                    RestartError::UnknownJobType {
                        job_type: record.job_type.clone(),
                    },
                ));
                continue;
            };

            match worker.load_job(monitor, &record).await {
                Ok(job) => {
                    info!(job_id = %job.id(), job_type = %record.job_type, "Job resumed");
                    report.resumed.push(job.id());
                }
                Err(e) => {
                    error!(job_id = %record.job_id, job_type = %record.job_type, error = %e, "Failed to resume job");
                    report.failed.push((record.job_id, e));
                }
            }
        }

        info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "Restart protocol finished"
        );
        Ok(report)
    }
}
