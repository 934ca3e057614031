//! Job monitor — registry of live jobs and the entry point for starting them.
//!
//! Every registered job gets a watcher task that forwards its status changes
//! onto the monitor's change stream, mirrors the status into the job store
//! for persistent jobs, logs failures and drops finished jobs from the
//! registry.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{JobError, StoreError};
use crate::jobs::context::{Job, JobContext, JobDefinition, JobDefinitionWithStart, box_work};
use crate::jobs::group::JobGroup;
use crate::jobs::task::JobTask;
use crate::jobs::types::{JobId, JobStatus};
use crate::store::{JobStateStore, PersistedJobState, PersistentJob};

/// What happened to a job in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobChangeKind {
    Add,
    Update,
    Remove,
}

/// One registry change.
#[derive(Clone)]
pub struct JobChange {
    pub kind: JobChangeKind,
    pub job: Arc<dyn Job>,
}

impl std::fmt::Debug for JobChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobChange")
            .field("kind", &self.kind)
            .field("job_id", &self.job.id())
            .field("status", &self.job.status())
            .finish()
    }
}

/// A [`JobChange`] narrowed to one definition type.
pub struct TypedJobChange<D: JobDefinition> {
    pub kind: JobChangeKind,
    pub job: Arc<JobContext<D>>,
}

type Registry = Arc<RwLock<HashMap<JobId, Arc<dyn Job>>>>;

/// Read-only, always-current view of the registry.
#[derive(Clone)]
pub struct JobsView {
    registry: Registry,
}

impl JobsView {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Arc<dyn Job>>> {
        match self.registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn get(&self, id: JobId) -> Option<Arc<dyn Job>> {
        self.read().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.read().keys().copied().collect()
    }

    /// The registered jobs at this instant.
    pub fn snapshot(&self) -> Vec<Arc<dyn Job>> {
        self.read().values().cloned().collect()
    }
}

/// Mirrors a persistent job's status into the store.
struct Mirror {
    store: Arc<dyn JobStateStore>,
    record: PersistedJobState,
}

impl Mirror {
    async fn apply(&self, status: JobStatus) {
        let id = self.record.job_id;
        let result = if status.is_terminal() {
            self.store.delete(id).await.map(|_| ())
        } else {
            self.store.save(&self.record.with_status(status)).await
        };
        if let Err(e) = result {
            warn!(job_id = %id, status = %status, error = %e, "Failed to persist job state");
        }
    }
}

fn same_job(a: &Arc<dyn Job>, b: &Arc<dyn Job>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Registry and launcher for jobs.
pub struct JobMonitor {
    registry: Registry,
    changes: broadcast::Sender<JobChange>,
    store: Option<Arc<dyn JobStateStore>>,
    event_capacity: usize,
    retain_finished: bool,
}

impl JobMonitor {
    /// A monitor without persistence.
    pub fn new(config: &EngineConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// A monitor that mirrors persistent jobs into `store`.
    pub fn with_store(config: &EngineConfig, store: Arc<dyn JobStateStore>) -> Arc<Self> {
        Self::build(config, Some(store))
    }

    fn build(config: &EngineConfig, store: Option<Arc<dyn JobStateStore>>) -> Arc<Self> {
        let (changes, _rx) = broadcast::channel(config.change_capacity.max(1));
        Arc::new(Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            changes,
            store,
            event_capacity: config.event_capacity,
            retain_finished: config.retain_finished,
        })
    }

    pub fn store(&self) -> Option<&Arc<dyn JobStateStore>> {
        self.store.as_ref()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Arc<dyn Job>>> {
        match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, kind: JobChangeKind, job: Arc<dyn Job>) {
        // Ok if nobody is listening.
        let _ = self.changes.send(JobChange { kind, job });
    }

    /// Add `job` to the registry, or replace the entry with the same id.
    ///
    /// The caller is responsible for starting a job registered this way.
    pub fn register_job(self: &Arc<Self>, job: Arc<dyn Job>) {
        self.register(job, None);
    }

    fn register(self: &Arc<Self>, job: Arc<dyn Job>, mirror: Option<Mirror>) {
        let previous = self.write().insert(job.id(), Arc::clone(&job));
        let already_watched = previous.as_ref().is_some_and(|p| same_job(p, &job));
        let kind = if previous.is_some() {
            JobChangeKind::Update
        } else {
            JobChangeKind::Add
        };
        debug!(job_id = %job.id(), job_type = job.definition_name(), ?kind, "Job registered");
        self.publish(kind, Arc::clone(&job));
        if !already_watched {
            self.watch(job, mirror);
        }
    }

    fn watch(self: &Arc<Self>, job: Arc<dyn Job>, mirror: Option<Mirror>) {
        let monitor: Weak<Self> = Arc::downgrade(self);
        let mut statuses = job.subscribe_status();
        tokio::spawn(async move {
            while let Some(status) = statuses.recv().await {
                if let Some(mirror) = &mirror {
                    mirror.apply(status).await;
                }
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.publish(JobChangeKind::Update, Arc::clone(&job));
                if status.is_terminal() {
                    monitor.finish(&job, status).await;
                    break;
                }
            }
        });
    }

    async fn finish(&self, job: &Arc<dyn Job>, status: JobStatus) {
        if status == JobStatus::Failed {
            // The fault is stored right after the terminal status is published.
            job.finished().await;
            match job.try_get_exception() {
                Some(err) => {
                    let message = format!("{err:#}");
                    error!(
                        job_id = %job.id(),
                        job_type = job.definition_name(),
                        error = %message,
                        "Job failed"
                    );
                }
                None => error!(job_id = %job.id(), "Job failed without a captured error"),
            }
        }

        if self.retain_finished {
            return;
        }
        let removed = {
            let mut registry = self.write();
            match registry.get(&job.id()) {
                Some(current) if same_job(current, job) => registry.remove(&job.id()),
                _ => None,
            }
        };
        if let Some(removed) = removed {
            debug!(job_id = %removed.id(), status = %status, "Finished job removed");
            self.publish(JobChangeKind::Remove, removed);
        }
    }

    /// Always-current view of the registered jobs.
    pub fn jobs(&self) -> JobsView {
        JobsView {
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn find(&self, id: JobId) -> Option<Arc<dyn Job>> {
        self.jobs().get(id)
    }

    /// Look up a job and downcast it to its concrete context.
    pub fn find_typed<D: JobDefinition>(&self, id: JobId) -> Option<Arc<JobContext<D>>> {
        self.find(id)?.as_any().downcast::<JobContext<D>>().ok()
    }

    /// Every add/update/remove from now on.
    pub fn changes(&self) -> impl Stream<Item = JobChange> + Send + 'static {
        BroadcastStream::new(self.changes.subscribe()).filter_map(|item| match item {
            Ok(change) => Some(change),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Job change subscriber lagged");
                None
            }
        })
    }

    /// Changes of jobs whose definition is `D`.
    pub fn changes_of<D: JobDefinition>(
        &self,
    ) -> impl Stream<Item = TypedJobChange<D>> + Send + 'static {
        self.changes().filter_map(|change| {
            if change.job.definition_type() != TypeId::of::<D>() {
                return None;
            }
            let job = change.job.as_any().downcast::<JobContext<D>>().ok()?;
            Some(TypedJobChange {
                kind: change.kind,
                job,
            })
        })
    }

    /// Start a job in a fresh private group.
    pub fn begin<D, F, Fut>(self: &Arc<Self>, definition: D, work: F) -> JobTask<D>
    where
        D: JobDefinition,
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        self.begin_in(&JobGroup::new(), definition, work)
    }

    /// Start a job inside `group`.
    pub fn begin_in<D, F, Fut>(self: &Arc<Self>, group: &JobGroup, definition: D, work: F) -> JobTask<D>
    where
        D: JobDefinition,
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        let ctx = JobContext::build(
            JobId::new(),
            definition,
            group,
            box_work(work),
            self.event_capacity,
        );
        self.launch(ctx, None)
    }

    /// Start a definition that carries its own work function.
    pub fn begin_job<D: JobDefinitionWithStart>(self: &Arc<Self>, definition: D) -> JobTask<D> {
        self.begin(definition, |ctx| D::run(ctx))
    }

    /// Start a job whose status is mirrored into the store.
    pub fn begin_persistent<D, F, Fut>(
        self: &Arc<Self>,
        definition: D,
        work: F,
    ) -> Result<JobTask<D>, StoreError>
    where
        D: PersistentJob,
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        self.begin_persistent_in(&JobGroup::new(), JobId::new(), definition, work)
    }

    /// Rehydrate a persisted job under its original id and start it.
    ///
    /// A job that was paused when it was persisted comes back paused.
    pub fn resume_persistent<D, F, Fut>(
        self: &Arc<Self>,
        record: &PersistedJobState,
        definition: D,
        work: F,
    ) -> Result<JobTask<D>, StoreError>
    where
        D: PersistentJob,
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        let group = JobGroup::new();
        if record.status == JobStatus::Paused {
            group.pause();
        }
        info!(job_id = %record.job_id, job_type = %record.job_type, "Resuming persisted job");
        self.begin_persistent_in(&group, record.job_id, definition, work)
    }

    fn begin_persistent_in<D, F, Fut>(
        self: &Arc<Self>,
        group: &JobGroup,
        id: JobId,
        definition: D,
        work: F,
    ) -> Result<JobTask<D>, StoreError>
    where
        D: PersistentJob,
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        let record = PersistedJobState::for_job(id, &definition, JobStatus::Created)?;
        let mirror = self.store.as_ref().map(|store| Mirror {
            store: Arc::clone(store),
            record,
        });
        let ctx = JobContext::build(id, definition, group, box_work(work), self.event_capacity);
        Ok(self.launch(ctx, mirror))
    }

    fn launch<D: JobDefinition>(
        self: &Arc<Self>,
        ctx: Arc<JobContext<D>>,
        mirror: Option<Mirror>,
    ) -> JobTask<D> {
        self.register(ctx.clone(), mirror);
        let runner = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = runner.start().await {
                warn!(job_id = %runner.id(), error = %e, "Job could not be started");
            }
        });
        JobTask::new(ctx)
    }

    /// Create jobs inside `group` through the returned scope.
    pub fn scope(self: &Arc<Self>, group: &JobGroup) -> GroupScope {
        GroupScope {
            monitor: Arc::clone(self),
            group: group.clone(),
        }
    }

    pub fn cancel(&self, id: JobId) -> bool {
        self.find(id).map(|job| job.cancel()).is_some()
    }

    pub fn pause(&self, id: JobId) -> bool {
        self.find(id).map(|job| job.pause()).is_some()
    }

    pub fn resume(&self, id: JobId) -> bool {
        self.find(id).map(|job| job.resume()).is_some()
    }

    pub fn cancel_all(&self) {
        info!(count = self.jobs().len(), "Cancelling all jobs");
        for job in self.jobs().snapshot() {
            job.cancel();
        }
    }

    pub fn pause_all(&self) {
        info!(count = self.jobs().len(), "Pausing all jobs");
        for job in self.jobs().snapshot() {
            job.pause();
        }
    }

    pub fn resume_all(&self) {
        info!(count = self.jobs().len(), "Resuming all jobs");
        for job in self.jobs().snapshot() {
            job.resume();
        }
    }

    pub fn cancel_group(&self, group: &JobGroup) {
        group.cancel();
    }

    pub fn pause_group(&self, group: &JobGroup) {
        group.pause();
    }

    pub fn resume_group(&self, group: &JobGroup) {
        group.resume();
    }
}

/// Launches jobs inside one group. Scopes nest: a nested scope targets its
/// own group and dropping it leaves the outer scope untouched.
#[derive(Clone)]
pub struct GroupScope {
    monitor: Arc<JobMonitor>,
    group: JobGroup,
}

impl GroupScope {
    pub fn group(&self) -> &JobGroup {
        &self.group
    }

    pub fn nested(&self, inner: &JobGroup) -> GroupScope {
        self.monitor.scope(inner)
    }

    pub fn begin<D, F, Fut>(&self, definition: D, work: F) -> JobTask<D>
    where
        D: JobDefinition,
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        self.monitor.begin_in(&self.group, definition, work)
    }

    pub fn begin_job<D: JobDefinitionWithStart>(&self, definition: D) -> JobTask<D> {
        self.monitor
            .begin_in(&self.group, definition, |ctx| D::run(ctx))
    }

    pub fn begin_persistent<D, F, Fut>(&self, definition: D, work: F) -> Result<JobTask<D>, StoreError>
    where
        D: PersistentJob,
        F: FnOnce(Arc<JobContext<D>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<D::Output, JobError>> + Send + 'static,
    {
        self.monitor
            .begin_persistent_in(&self.group, JobId::new(), definition, work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::store::InMemoryJobStore;

    struct Echo;

    impl JobDefinition for Echo {
        type Output = u32;
    }

    struct Other;

    impl JobDefinition for Other {
        type Output = ();
    }

    fn monitor() -> Arc<JobMonitor> {
        JobMonitor::new(&EngineConfig::default())
    }

    async fn wait_until_removed(monitor: &JobMonitor, id: JobId) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while monitor.jobs().contains(id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("finished job should leave the registry");
    }

    #[tokio::test]
    async fn begin_registers_and_removes_on_completion() {
        let monitor = monitor();
        let task = monitor.begin(Echo, |_ctx| async move { Ok(42) });
        assert!(monitor.jobs().contains(task.id()));

        assert_eq!(task.wait().await.unwrap(), 42);
        wait_until_removed(&monitor, task.id()).await;
        assert!(monitor.jobs().is_empty());
    }

    #[tokio::test]
    async fn retain_finished_keeps_jobs() {
        let config = EngineConfig {
            retain_finished: true,
            ..EngineConfig::default()
        };
        let monitor = JobMonitor::new(&config);
        let task = monitor.begin(Echo, |_ctx| async move { Ok(1) });
        task.wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let job = monitor.find(task.id()).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn change_stream_reports_add_updates_and_remove() {
        let monitor = monitor();
        let mut changes = Box::pin(monitor.changes());
        let task = monitor.begin(Echo, |_ctx| async move { Ok(0) });

        let mut kinds = Vec::new();
        let mut statuses = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(change) = changes.next().await {
                kinds.push(change.kind);
                if change.kind == JobChangeKind::Update {
                    statuses.push(change.job.status());
                }
                if change.kind == JobChangeKind::Remove {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(kinds.first(), Some(&JobChangeKind::Add));
        assert_eq!(kinds.last(), Some(&JobChangeKind::Remove));
        assert!(statuses.contains(&JobStatus::Completed));
        assert!(!monitor.jobs().contains(task.id()));
    }

    #[tokio::test]
    async fn typed_changes_only_yield_matching_definitions() {
        let monitor = monitor();
        let mut echoes = Box::pin(monitor.changes_of::<Echo>());
        monitor.begin(Other, |_ctx| async move { Ok(()) });
        let echo = monitor.begin(Echo, |_ctx| async move { Ok(9) });

        let first = tokio::time::timeout(Duration::from_secs(1), echoes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job.id(), echo.id());
        assert_eq!(first.kind, JobChangeKind::Add);
    }

    #[tokio::test]
    async fn register_job_is_idempotent() {
        let monitor = monitor();
        let group = JobGroup::new();
        let ctx = JobContext::new(Echo, &group, |_ctx| async move { Ok(3) });
        let mut changes = Box::pin(monitor.changes());

        monitor.register_job(ctx.clone());
        monitor.register_job(ctx.clone());
        assert_eq!(monitor.jobs().len(), 1);

        let first = changes.next().await.unwrap();
        let second = changes.next().await.unwrap();
        assert_eq!(first.kind, JobChangeKind::Add);
        assert_eq!(second.kind, JobChangeKind::Update);

        assert!(monitor.find_typed::<Echo>(ctx.id()).is_some());
        assert!(monitor.find_typed::<Other>(ctx.id()).is_none());
    }

    #[tokio::test]
    async fn control_by_id_reaches_the_job() {
        let monitor = monitor();
        let task = monitor.begin(Echo, |ctx| async move {
            loop {
                ctx.yield_now().await?;
            }
        });
        assert!(monitor.cancel(task.id()));
        assert!(task.wait().await.unwrap_err().is_cancelled());
        assert!(!monitor.cancel(JobId::new()));
    }

    #[tokio::test]
    async fn scopes_launch_into_their_group() {
        let monitor = monitor();
        let outer = JobGroup::new();
        let inner = JobGroup::new();
        let scope = monitor.scope(&outer);

        let a = scope.begin(Echo, |ctx| async move {
            loop {
                ctx.yield_now().await?;
            }
        });
        let b = {
            let nested = scope.nested(&inner);
            nested.begin(Echo, |_ctx| async move { Ok(5) })
        };
        let c = scope.begin(Echo, |ctx| async move {
            loop {
                ctx.yield_now().await?;
            }
        });

        assert!(a.job().group().is_same(&outer));
        assert!(b.job().group().is_same(&inner));
        assert!(c.job().group().is_same(&outer));

        monitor.cancel_group(&outer);
        assert!(a.wait().await.unwrap_err().is_cancelled());
        assert!(c.wait().await.unwrap_err().is_cancelled());
        assert_eq!(b.wait().await.unwrap(), 5);
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Persisted {
        name: String,
    }

    impl JobDefinition for Persisted {
        type Output = ();
    }

    impl PersistentJob for Persisted {
        const JOB_TYPE: &'static str = "persisted";
    }

    #[tokio::test]
    async fn persistent_job_is_mirrored_then_deleted() {
        let store = Arc::new(InMemoryJobStore::new());
        let monitor = JobMonitor::with_store(&EngineConfig::default(), store.clone());
        let task = monitor
            .begin_persistent(Persisted { name: "a".into() }, |ctx| async move {
                loop {
                    ctx.yield_now().await?;
                }
            })
            .unwrap();

        task.pause();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(rec) = store.get(task.id()).await.unwrap() {
                    if rec.status == JobStatus::Paused {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("paused status should be persisted");

        task.cancel();
        assert!(task.wait().await.unwrap_err().is_cancelled());
        wait_until_removed(&monitor, task.id()).await;
        assert!(store.get(task.id()).await.unwrap().is_none());
    }
}
