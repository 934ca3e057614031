//! Job context — drives one job through its lifecycle and publishes its state.

use std::any::{Any, TypeId};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::JobError;
use crate::jobs::events::{DEFAULT_EVENT_CAPACITY, EventSource, Subscription};
use crate::jobs::group::JobGroup;
use crate::jobs::token::{Checkpoint, Interruption, JobCancellationToken};
use crate::jobs::types::{JobId, JobStatus, Percent, Progress};

/// Describes *what* a job does. Owned by its [`JobContext`] for the
/// context's whole lifetime and dropped together with it.
pub trait JobDefinition: Send + Sync + 'static {
    /// Value the job produces on success.
    type Output: Clone + Send + Sync + 'static;

    /// Definitions that cannot be paused are cancelled by `pause()` instead.
    const SUPPORTS_PAUSING: bool = true;
}

/// A definition that carries its own work function.
#[async_trait]
pub trait JobDefinitionWithStart: JobDefinition + Sized {
    async fn run(ctx: Arc<JobContext<Self>>) -> Result<Self::Output, JobError>;
}

/// Boxed future returned by a work function.
pub type WorkFuture<T> = BoxFuture<'static, Result<T, JobError>>;

pub(crate) type WorkFn<D> =
    Box<dyn FnOnce(Arc<JobContext<D>>) -> WorkFuture<<D as JobDefinition>::Output> + Send>;

pub(crate) fn box_work<D, F, Fut>(work: F) -> WorkFn<D>
where
    D: JobDefinition,
    F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
{
    Box::new(move |ctx| work(ctx).boxed())
}

/// Type-erased view of a job, used by the monitor, groups and observers.
pub trait Job: Send + Sync + 'static {
    fn id(&self) -> JobId;
    fn status(&self) -> JobStatus;
    fn progress(&self) -> Progress;
    fn rate_of_progress(&self) -> Option<f64>;
    /// `TypeId` of the job's definition.
    fn definition_type(&self) -> TypeId;
    fn definition_name(&self) -> &'static str;
    fn group(&self) -> &JobGroup;
    fn subscribe_status(&self) -> Subscription<JobStatus>;
    fn subscribe_progress(&self) -> Subscription<Progress>;
    fn cancel(&self);
    fn pause(&self);
    fn resume(&self);
    /// The captured fault of a failed job.
    fn try_get_exception(&self) -> Option<Arc<anyhow::Error>>;
    /// Resolves once the result slot is filled.
    fn finished(&self) -> BoxFuture<'_, ()>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Per-job engine: status, progress, token and the single-resolution result.
pub struct JobContext<D: JobDefinition> {
    id: JobId,
    definition: D,
    group: JobGroup,
    token: JobCancellationToken,
    status: AtomicU8,
    /// Held while a status change is checked, stored and published.
    transitions: Mutex<()>,
    status_events: EventSource<JobStatus>,
    progress: EventSource<Progress>,
    rate: EventSource<Option<f64>>,
    work: Mutex<Option<WorkFn<D>>>,
    outcome: watch::Sender<Option<Result<D::Output, JobError>>>,
}

impl<D: JobDefinition> JobContext<D> {
    /// Create a context inside `group`. The job does not run until
    /// [`start`](Self::start) is called.
    pub fn new<F, Fut>(definition: D, group: &JobGroup, work: F) -> Arc<Self>
    where
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        Self::build(
            JobId::new(),
            definition,
            group,
            box_work(work),
            DEFAULT_EVENT_CAPACITY,
        )
    }

    /// Like [`new`](Self::new) but reusing a known id (restart recovery).
    pub fn with_id<F, Fut>(id: JobId, definition: D, group: &JobGroup, work: F) -> Arc<Self>
    where
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        Self::build(id, definition, group, box_work(work), DEFAULT_EVENT_CAPACITY)
    }

    pub(crate) fn build(
        id: JobId,
        definition: D,
        group: &JobGroup,
        work: WorkFn<D>,
        event_capacity: usize,
    ) -> Arc<Self> {
        let (outcome, _rx) = watch::channel(None);
        let ctx = Arc::new(Self {
            id,
            definition,
            group: group.clone(),
            token: group.token().clone(),
            status: AtomicU8::new(JobStatus::None as u8),
            transitions: Mutex::new(()),
            status_events: EventSource::with_capacity(JobStatus::None, event_capacity),
            progress: EventSource::with_capacity(None, event_capacity),
            rate: EventSource::with_capacity(None, event_capacity),
            work: Mutex::new(Some(work)),
            outcome,
        });
        ctx.transition(JobStatus::Created);
        let erased: Arc<dyn Job> = ctx.clone();
        group.attach(&erased);
        ctx
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn definition(&self) -> &D {
        &self.definition
    }

    pub fn group(&self) -> &JobGroup {
        &self.group
    }

    pub fn token(&self) -> &JobCancellationToken {
        &self.token
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn progress(&self) -> Progress {
        self.progress.latest()
    }

    pub fn rate_of_progress(&self) -> Option<f64> {
        self.rate.latest()
    }

    pub fn subscribe_status(&self) -> Subscription<JobStatus> {
        self.status_events.subscribe()
    }

    pub fn subscribe_progress(&self) -> Subscription<Progress> {
        self.progress.subscribe()
    }

    pub fn subscribe_rate(&self) -> Subscription<Option<f64>> {
        self.rate.subscribe()
    }

    fn definition_name(&self) -> &'static str {
        std::any::type_name::<D>()
    }

    fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        match self.transitions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Move to `next`, publishing it.
    fn set_status(&self, next: JobStatus) -> Result<(), JobError> {
        let _guard = self.lock_transitions();
        let current = self.status();
        if let Err(err) = current.validate_transition(self.id, next) {
            error!(
                job_id = %self.id,
                from = %current,
                to = %next,
                "Invalid job status transition"
            );
            if cfg!(debug_assertions) {
                panic!("{err}");
            }
            return Err(err);
        }
        self.status.store(next as u8, Ordering::Release);
        self.status_events.publish(next);
        debug!(job_id = %self.id, from = %current, to = %next, "Job status changed");
        Ok(())
    }

    /// `set_status` for transitions the engine itself guarantees.
    fn transition(&self, next: JobStatus) {
        let _ = self.set_status(next);
    }

    /// Move `from -> to` if the job is still in `from` and `still_wanted`
    /// holds. Concurrent checkpoints of one job race here and only the
    /// first of them publishes the change.
    fn advance(
        &self,
        from: JobStatus,
        to: JobStatus,
        still_wanted: impl FnOnce() -> bool,
    ) -> bool {
        let _guard = self.lock_transitions();
        if self.status() != from || !still_wanted() {
            return false;
        }
        self.status.store(to as u8, Ordering::Release);
        self.status_events.publish(to);
        debug!(job_id = %self.id, from = %from, to = %to, "Job status changed");
        true
    }

    /// Run the work function to completion.
    ///
    /// Returns the terminal status. The result slot is resolved exactly once,
    /// after the terminal status has been published.
    pub async fn start(self: &Arc<Self>) -> Result<JobStatus, JobError> {
        let work = match self.work.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(work) = work else {
            return Err(JobError::AlreadyStarted { id: self.id });
        };

        self.set_status(JobStatus::Running)?;
        info!(job_id = %self.id, job_type = self.definition_name(), "Job started");

        // A pause or cancel may have been requested before the job ran.
        let result = match self.yield_now().await {
            Err(err) => Err(err),
            Ok(()) => AssertUnwindSafe(work(Arc::clone(self)))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(JobError::from(anyhow::anyhow!(
                        "work function panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                }),
        };

        // Still paused here means the job was cancelled while suspended, or
        // the work finished while one of its branches was parked.
        let result = if self.status() != JobStatus::Paused {
            result
        } else if self.token.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            self.advance(JobStatus::Paused, JobStatus::Running, || true);
            result
        };

        let terminal = match &result {
            Ok(_) => JobStatus::Completed,
            Err(JobError::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };
        self.transition(terminal);
        match &result {
            Ok(_) => info!(job_id = %self.id, "Job completed"),
            Err(JobError::Cancelled) => info!(job_id = %self.id, "Job cancelled"),
            Err(err) => info!(job_id = %self.id, error = %err, "Job failed"),
        }
        self.outcome.send_replace(Some(result));
        Ok(terminal)
    }

    /// Cooperative checkpoint.
    ///
    /// Fails with [`JobError::Cancelled`] once the job is cancelled, and
    /// suspends here while the job is paused.
    pub async fn yield_now(&self) -> Result<(), JobError> {
        if self.token.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        tokio::task::yield_now().await;
        loop {
            match self.token.checkpoint() {
                Checkpoint::Continue => return Ok(()),
                Checkpoint::CancelRequested => return Err(JobError::Cancelled),
                Checkpoint::PauseRequested => self.suspend().await?,
            }
        }
    }

    /// Run `fut` until it finishes or the job is paused or cancelled.
    pub async fn interruptible<F: Future>(&self, fut: F) -> Result<F::Output, Interruption> {
        tokio::select! {
            biased;
            interruption = self.token.interrupted() => Err(interruption),
            output = fut => Ok(output),
        }
    }

    /// Turn an interruption back into a suspend/resume cycle.
    ///
    /// A pausing interruption waits for resume and returns `Ok(())` so the
    /// interrupted operation can be retried; a terminal one is returned as
    /// [`JobError::Cancelled`].
    pub async fn handle_interrupt(&self, interruption: Interruption) -> Result<(), JobError> {
        if !self.token.is_pausing_cancellation(&interruption) {
            return Err(JobError::Cancelled);
        }
        match self.token.checkpoint() {
            Checkpoint::PauseRequested => self.suspend().await,
            Checkpoint::CancelRequested => Err(JobError::Cancelled),
            Checkpoint::Continue => {
                // Resumed before we got here.
                self.token.recycle_token();
                Ok(())
            }
        }
    }

    /// Park the caller until the pause is lifted. Every checkpoint that
    /// sees the pause waits here; the status flips once per pause.
    async fn suspend(&self) -> Result<(), JobError> {
        self.token.recycle_token();
        let token = &self.token;
        if self.advance(JobStatus::Running, JobStatus::Paused, || token.is_paused()) {
            info!(job_id = %self.id, "Job paused");
        }

        match self.token.wait_for_resume().await {
            Checkpoint::CancelRequested => Err(JobError::Cancelled),
            _ => {
                if self.advance(JobStatus::Paused, JobStatus::Running, || !token.is_paused()) {
                    info!(job_id = %self.id, "Job resumed");
                }
                Ok(())
            }
        }
    }

    /// Report `current / max` as progress.
    pub fn set_percent(&self, current: u64, max: u64) {
        self.progress.publish(Some(Percent::from_ratio(current, max)));
    }

    /// Report a fraction in `[0, 1]`; out-of-range values are clamped.
    pub fn set_fraction(&self, fraction: f64) {
        self.progress.publish(Some(Percent::clamped(fraction)));
    }

    /// Report work units per second.
    pub fn set_rate_of_progress(&self, rate: f64) {
        self.rate.publish(Some(rate));
    }

    pub fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }
        info!(job_id = %self.id, "Cancel requested");
        self.token.cancel();
    }

    pub fn pause(&self) {
        if self.status().is_terminal() {
            return;
        }
        if !D::SUPPORTS_PAUSING {
            debug!(job_id = %self.id, "Job does not support pausing, cancelling instead");
            self.cancel();
            return;
        }
        info!(job_id = %self.id, "Pause requested");
        self.token.pause();
    }

    pub fn resume(&self) {
        if self.status().is_terminal() {
            return;
        }
        self.token.resume();
    }

    /// Wait for the job to finish.
    pub async fn wait_for_result(&self) -> Result<D::Output, JobError> {
        let mut rx = self.outcome.subscribe();
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => match &*outcome {
                Some(result) => result.clone(),
                None => Err(JobError::Cancelled),
            },
            Err(_) => Err(JobError::Cancelled),
        }
    }

    /// The outcome if the job has finished.
    pub fn try_result(&self) -> Option<Result<D::Output, JobError>> {
        self.outcome.borrow().clone()
    }

    /// The captured fault of a failed job; `None` while running or on any
    /// other outcome.
    pub fn try_get_exception(&self) -> Option<Arc<anyhow::Error>> {
        match &*self.outcome.borrow() {
            Some(Err(JobError::Failed(err))) => Some(Arc::clone(err)),
            _ => None,
        }
    }
}

impl<D: JobDefinition> Job for JobContext<D> {
    fn id(&self) -> JobId {
        self.id
    }

    fn status(&self) -> JobStatus {
        JobContext::status(self)
    }

    fn progress(&self) -> Progress {
        JobContext::progress(self)
    }

    fn rate_of_progress(&self) -> Option<f64> {
        JobContext::rate_of_progress(self)
    }

    fn definition_type(&self) -> TypeId {
        TypeId::of::<D>()
    }

    fn definition_name(&self) -> &'static str {
        JobContext::definition_name(self)
    }

    fn group(&self) -> &JobGroup {
        &self.group
    }

    fn subscribe_status(&self) -> Subscription<JobStatus> {
        JobContext::subscribe_status(self)
    }

    fn subscribe_progress(&self) -> Subscription<Progress> {
        JobContext::subscribe_progress(self)
    }

    fn cancel(&self) {
        JobContext::cancel(self)
    }

    fn pause(&self) {
        JobContext::pause(self)
    }

    fn resume(&self) {
        JobContext::resume(self)
    }

    fn try_get_exception(&self) -> Option<Arc<anyhow::Error>> {
        JobContext::try_get_exception(self)
    }

    fn finished(&self) -> BoxFuture<'_, ()> {
        async move {
            let _ = self.wait_for_result().await;
        }
        .boxed()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use anyhow::Context as _;

    struct Counting;

    impl JobDefinition for Counting {
        type Output = u32;
    }

    struct Unpausable;

    impl JobDefinition for Unpausable {
        type Output = ();
        const SUPPORTS_PAUSING: bool = false;
    }

    struct Tracked(Arc<AtomicUsize>);

    impl JobDefinition for Tracked {
        type Output = ();
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawn_start<D: JobDefinition>(ctx: &Arc<JobContext<D>>) -> tokio::task::JoinHandle<()> {
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let _ = ctx.start().await;
        })
    }

    #[tokio::test]
    async fn completes_with_ordered_status_events() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |_ctx| async move { Ok(7) });
        let mut statuses = ctx.subscribe_status();

        assert_eq!(ctx.status(), JobStatus::Created);
        let terminal = ctx.start().await.unwrap();
        assert_eq!(terminal, JobStatus::Completed);
        assert_eq!(ctx.wait_for_result().await.unwrap(), 7);

        let mut seen = Vec::new();
        while let Some(status) = statuses.try_recv() {
            seen.push(status);
        }
        assert_eq!(
            seen,
            vec![JobStatus::Created, JobStatus::Running, JobStatus::Completed]
        );
        assert!(ctx.try_get_exception().is_none());
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |_ctx| async move { Ok(1) });
        ctx.start().await.unwrap();
        let err = ctx.start().await.unwrap_err();
        assert!(matches!(err, JobError::AlreadyStarted { .. }));
        assert_eq!(ctx.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn fault_is_captured_and_retrievable() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |_ctx| async move {
            let parsed: u32 = "not a number"
                .parse::<u32>()
                .context("parsing archive header")?;
            Ok(parsed)
        });
        assert!(ctx.try_get_exception().is_none());

        assert_eq!(ctx.start().await.unwrap(), JobStatus::Failed);
        let err = ctx.wait_for_result().await.unwrap_err();
        assert!(err.fault().is_some());

        let captured = ctx.try_get_exception().expect("failed job exposes its error");
        assert!(captured.to_string().contains("parsing archive header"));
    }

    #[tokio::test]
    async fn panicking_work_function_fails_the_job() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |_ctx| async move {
            if true {
                panic!("boom");
            }
            Ok(0)
        });
        assert_eq!(ctx.start().await.unwrap(), JobStatus::Failed);
        let captured = ctx.try_get_exception().unwrap();
        assert!(captured.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn cancel_before_start_skips_work() {
        let ran = Arc::new(AtomicBool::new(false));
        let group = JobGroup::new();
        let flag = Arc::clone(&ran);
        let ctx = JobContext::new(Counting, &group, move |_ctx| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(1)
        });
        ctx.cancel();
        assert_eq!(ctx.start().await.unwrap(), JobStatus::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(ctx.wait_for_result().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn pause_before_start_waits_for_resume() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |_ctx| async move { Ok(3) });
        ctx.pause();
        let handle = spawn_start(&ctx);

        let mut statuses = ctx.subscribe_status();
        statuses.wait_for(|s| *s == JobStatus::Paused).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.status(), JobStatus::Paused);

        ctx.resume();
        handle.await.unwrap();
        assert_eq!(ctx.status(), JobStatus::Completed);
        assert_eq!(ctx.wait_for_result().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn cancel_while_paused_does_not_deadlock() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |ctx| async move {
            loop {
                ctx.yield_now().await?;
            }
        });
        let handle = spawn_start(&ctx);
        ctx.pause();
        ctx.subscribe_status()
            .wait_for(|s| *s == JobStatus::Paused)
            .await;

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("paused job must observe cancel")
            .unwrap();
        assert_eq!(ctx.status(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn interrupted_operation_is_retried_after_resume() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let group = JobGroup::new();
        let counter = Arc::clone(&attempts);
        let ctx = JobContext::new(Counting, &group, move |ctx| async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                let slow = tokio::time::sleep(Duration::from_millis(50));
                match ctx.interruptible(slow).await {
                    Ok(()) => return Ok(counter.load(Ordering::SeqCst) as u32),
                    Err(interruption) => ctx.handle_interrupt(interruption).await?,
                }
            }
        });
        let handle = spawn_start(&ctx);
        let mut statuses = ctx.subscribe_status();
        while attempts.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        ctx.pause();
        statuses.wait_for(|s| *s == JobStatus::Paused).await;
        assert!(!ctx.token().cancellation_token().is_cancelled());

        ctx.resume();
        handle.await.unwrap();
        assert_eq!(ctx.status(), JobStatus::Completed);
        assert_eq!(ctx.wait_for_result().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn terminal_interruption_propagates() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |ctx| async move {
            let forever = futures::future::pending::<()>();
            match ctx.interruptible(forever).await {
                Ok(()) => Ok(0),
                Err(interruption) => {
                    ctx.handle_interrupt(interruption).await?;
                    Ok(1)
                }
            }
        });
        let handle = spawn_start(&ctx);
        ctx.subscribe_status()
            .wait_for(|s| *s == JobStatus::Running)
            .await;
        ctx.cancel();
        handle.await.unwrap();
        assert_eq!(ctx.status(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn pause_on_unpausable_job_cancels() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Unpausable, &group, |ctx| async move {
            loop {
                ctx.yield_now().await?;
            }
        });
        let handle = spawn_start(&ctx);
        ctx.pause();
        handle.await.unwrap();
        assert_eq!(ctx.status(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn requests_on_finished_job_are_ignored() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |_ctx| async move { Ok(5) });
        ctx.start().await.unwrap();
        ctx.pause();
        ctx.cancel();
        ctx.resume();
        assert_eq!(ctx.status(), JobStatus::Completed);
        assert!(!group.token().is_cancelled());
        assert_eq!(ctx.wait_for_result().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn progress_is_clamped_and_published() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |ctx| async move {
            ctx.set_percent(5, 10);
            ctx.set_percent(15, 10);
            ctx.set_rate_of_progress(2.5);
            Ok(0)
        });
        let mut progress = ctx.subscribe_progress();
        ctx.start().await.unwrap();

        assert_eq!(progress.try_recv(), Some(None));
        assert_eq!(progress.try_recv(), Some(Some(Percent::clamped(0.5))));
        assert_eq!(progress.try_recv(), Some(Some(Percent::FULL)));
        assert_eq!(ctx.progress(), Some(Percent::FULL));
        assert_eq!(ctx.rate_of_progress(), Some(2.5));
    }

    async fn segment(ctx: &JobContext<Counting>, steps: u32) -> Result<u32, JobError> {
        for _ in 0..steps {
            ctx.yield_now().await?;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(steps)
    }

    fn drain(statuses: &mut Subscription<JobStatus>) -> Vec<JobStatus> {
        let mut seen = Vec::new();
        while let Some(status) = statuses.try_recv() {
            seen.push(status);
        }
        seen
    }

    #[tokio::test]
    async fn concurrent_checkpoints_share_one_pause() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |ctx| async move {
            let (a, b) = tokio::join!(segment(&ctx, 40), segment(&ctx, 40));
            Ok(a? + b?)
        });
        let mut statuses = ctx.subscribe_status();
        let handle = spawn_start(&ctx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.pause();
        ctx.subscribe_status()
            .wait_for(|s| *s == JobStatus::Paused)
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ctx.status(), JobStatus::Paused);

        ctx.resume();
        handle.await.unwrap();
        assert_eq!(ctx.status(), JobStatus::Completed);
        assert_eq!(ctx.wait_for_result().await.unwrap(), 80);
        assert_eq!(
            drain(&mut statuses),
            vec![
                JobStatus::Created,
                JobStatus::Running,
                JobStatus::Paused,
                JobStatus::Running,
                JobStatus::Completed
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn spawned_branches_pause_and_resume_together() {
        let group = JobGroup::new();
        let ctx = JobContext::new(Counting, &group, |ctx| async move {
            let branches: Vec<_> = (0..4)
                .map(|_| {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move { segment(&ctx, 30).await })
                })
                .collect();
            let mut total = 0;
            for branch in futures::future::join_all(branches).await {
                total += branch.map_err(anyhow::Error::from)??;
            }
            Ok(total)
        });
        let mut statuses = ctx.subscribe_status();
        let handle = spawn_start(&ctx);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.pause();
            ctx.subscribe_status()
                .wait_for(|s| *s == JobStatus::Paused)
                .await;
            ctx.resume();
        }

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("resumed job should finish")
            .unwrap();
        assert_eq!(ctx.status(), JobStatus::Completed);
        assert_eq!(ctx.wait_for_result().await.unwrap(), 120);

        let seen = drain(&mut statuses);
        assert_eq!(seen.last(), Some(&JobStatus::Completed));
        assert!(!seen.contains(&JobStatus::Cancelled));
        assert!(!seen.contains(&JobStatus::Failed));
        assert!(seen.windows(2).all(|w| w[0] != w[1]));
    }

    #[tokio::test]
    async fn definition_is_dropped_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let group = JobGroup::new();
        let ctx = JobContext::new(Tracked(Arc::clone(&drops)), &group, |_ctx| async move {
            Ok(())
        });
        ctx.start().await.unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(ctx);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(group.members().is_empty());
    }
}
