//! Awaitable handle to a running job.

use std::future::IntoFuture;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::JobError;
use crate::jobs::context::{JobContext, JobDefinition};
use crate::jobs::types::{JobId, JobStatus, Progress};

/// Handle returned by the monitor's `begin*` methods.
///
/// `task.await` yields the job's result.
pub struct JobTask<D: JobDefinition> {
    ctx: Arc<JobContext<D>>,
}

impl<D: JobDefinition> JobTask<D> {
    pub fn new(ctx: Arc<JobContext<D>>) -> Self {
        Self { ctx }
    }

    pub fn id(&self) -> JobId {
        self.ctx.id()
    }

    pub fn job(&self) -> &Arc<JobContext<D>> {
        &self.ctx
    }

    pub fn definition(&self) -> &D {
        self.ctx.definition()
    }

    pub fn status(&self) -> JobStatus {
        self.ctx.status()
    }

    pub fn progress(&self) -> Progress {
        self.ctx.progress()
    }

    pub async fn wait(&self) -> Result<D::Output, JobError> {
        self.ctx.wait_for_result().await
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub fn pause(&self) {
        self.ctx.pause();
    }

    pub fn resume(&self) {
        self.ctx.resume();
    }

    pub fn into_inner(self) -> Arc<JobContext<D>> {
        self.ctx
    }
}

impl<D: JobDefinition> Clone for JobTask<D> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<D: JobDefinition> IntoFuture for JobTask<D> {
    type Output = Result<D::Output, JobError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.ctx.wait_for_result().await }.boxed()
    }
}
