use std::sync::Arc;
use std::time::Duration;

use job_engine::builtin::{FileCopyJob, FileCopyWorker};
use job_engine::config::EngineConfig;
use job_engine::jobs::{JobContext, JobDefinitionWithStart, JobMonitor, JobStatus};
use job_engine::recovery::{JobRestarter, WorkerRegistry};
use job_engine::store::{InMemoryJobStore, JobStateStore, LibSqlJobStore};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env()?;

    eprintln!("Job Engine v{}", env!("CARGO_PKG_VERSION"));
    match &config.db_path {
        Some(path) => eprintln!("   Job store: {}", path.display()),
        None => eprintln!("   Job store: in-memory (set JOB_ENGINE_DB_PATH to persist)"),
    }

    // ── Job store ────────────────────────────────────────────────────────
    let store: Arc<dyn JobStateStore> = match &config.db_path {
        Some(path) => Arc::new(LibSqlJobStore::new_local(path).await?),
        None => Arc::new(InMemoryJobStore::new()),
    };
    let monitor = JobMonitor::with_store(&config, store);

    // ── Restart protocol (before any new job is issued) ──────────────────
    let workers = WorkerRegistry::new().with(Arc::new(FileCopyWorker::new()));
    let restarter = JobRestarter::new(workers);
    let report = restarter.restart(&monitor).await?;
    for (id, err) in &report.failed {
        warn!(job_id = %id, error = %err, "Persisted job was not resumed");
    }

    let mut jobs: Vec<Arc<JobContext<FileCopyJob>>> = report
        .resumed
        .iter()
        .filter_map(|id| monitor.find_typed::<FileCopyJob>(*id))
        .collect();

    // ── New work from the command line ───────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {}
        [cmd, source, destination] if cmd == "copy" => {
            let job = FileCopyJob::new(source, destination, config.copy_chunk_bytes);
            let task = monitor.begin_persistent(job, |ctx| FileCopyJob::run(ctx))?;
            info!(job_id = %task.id(), "Copy started");
            jobs.push(task.into_inner());
        }
        _ => {
            eprintln!("Usage: job-engine [copy <source> <destination>]");
            std::process::exit(2);
        }
    }

    if jobs.is_empty() {
        info!("No jobs to run");
        return Ok(());
    }

    let all_done = futures::future::join_all(jobs.iter().map(|job| job.wait_for_result()));
    tokio::select! {
        results = all_done => {
            for (job, result) in jobs.iter().zip(results) {
                match result {
                    Ok(bytes) => info!(job_id = %job.id(), bytes, "Copy finished"),
                    Err(e) => warn!(job_id = %job.id(), error = %e, "Copy did not finish"),
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, pausing jobs");
            monitor.pause_all();
            for job in &jobs {
                let mut statuses = job.subscribe_status();
                let settled = statuses.wait_for(|s| *s == JobStatus::Paused || s.is_terminal());
                if tokio::time::timeout(Duration::from_secs(2), settled).await.is_err() {
                    warn!(job_id = %job.id(), "Job did not pause in time");
                }
            }
        }
    }

    Ok(())
}
