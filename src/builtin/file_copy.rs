//! Resumable chunked file copy.
//!
//! The destination itself is the checkpoint: a copy resumed after a restart
//! continues from the destination's current length.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::JobError;
use crate::jobs::context::{JobContext, JobDefinition, JobDefinitionWithStart};
use crate::recovery::worker::DefinitionWorker;
use crate::store::PersistentJob;

/// Copy `source` to `destination` in chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCopyJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub chunk_bytes: usize,
}

impl FileCopyJob {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, chunk_bytes: usize) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            chunk_bytes: chunk_bytes.max(1),
        }
    }
}

impl JobDefinition for FileCopyJob {
    /// Total bytes in the destination when done.
    type Output = u64;
}

impl PersistentJob for FileCopyJob {
    const JOB_TYPE: &'static str = "file_copy";
}

/// Rehydrates interrupted copies.
pub type FileCopyWorker = DefinitionWorker<FileCopyJob>;

async fn resume_offset(destination: &Path, total: u64) -> u64 {
    match tokio::fs::metadata(destination).await {
        Ok(meta) if meta.len() <= total => meta.len(),
        // Longer than the source: not ours to trust, start over.
        Ok(_) => 0,
        Err(_) => 0,
    }
}

#[async_trait]
impl JobDefinitionWithStart for FileCopyJob {
    async fn run(ctx: Arc<JobContext<Self>>) -> Result<u64, JobError> {
        let job = ctx.definition();
        let total = tokio::fs::metadata(&job.source)
            .await
            .with_context(|| format!("reading {}", job.source.display()))?
            .len();

        let offset = resume_offset(&job.destination, total).await;
        if let Some(parent) = job.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut source = tokio::fs::File::open(&job.source)
            .await
            .with_context(|| format!("opening {}", job.source.display()))?;
        let mut destination = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&job.destination)
            .await
            .with_context(|| format!("opening {}", job.destination.display()))?;
        destination.set_len(offset).await?;
        source.seek(std::io::SeekFrom::Start(offset)).await?;
        destination.seek(std::io::SeekFrom::Start(offset)).await?;

        if offset > 0 {
            info!(job_id = %ctx.id(), offset, total, "Resuming file copy");
        }

        let started = Instant::now();
        let mut copied = offset;
        let mut buf = vec![0u8; job.chunk_bytes];
        ctx.set_percent(copied, total);

        loop {
            ctx.yield_now().await?;

            let read = source.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            destination.write_all(&buf[..read]).await?;
            copied += read as u64;

            ctx.set_percent(copied, total);
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                ctx.set_rate_of_progress((copied - offset) as f64 / elapsed);
            }
        }

        destination.flush().await?;
        debug!(job_id = %ctx.id(), bytes = copied, "File copy finished");
        Ok(copied)
    }
}
