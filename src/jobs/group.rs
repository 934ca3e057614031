//! Job groups — one cancellation/pause scope shared by many jobs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tracing::info;
use uuid::Uuid;

use crate::jobs::context::Job;
use crate::jobs::token::JobCancellationToken;
use crate::jobs::types::JobId;

struct GroupInner {
    id: Uuid,
    token: JobCancellationToken,
    members: RwLock<HashMap<JobId, Weak<dyn Job>>>,
}

/// A set of jobs sharing one token. Cheap to clone.
///
/// Members are held weakly: a group never keeps a finished job alive.
#[derive(Clone)]
pub struct JobGroup {
    inner: Arc<GroupInner>,
}

impl JobGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                id: Uuid::new_v4(),
                token: JobCancellationToken::new(),
                members: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The token every member observes.
    pub fn token(&self) -> &JobCancellationToken {
        &self.inner.token
    }

    /// Add a job. Safe to call concurrently with `cancel`/`pause`/`resume`;
    /// a job attached after a cancel sees the cancelled token at once.
    pub fn attach(&self, job: &Arc<dyn Job>) {
        let mut members = match self.inner.members.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        members.retain(|_, member| member.strong_count() > 0);
        members.insert(job.id(), Arc::downgrade(job));
    }

    /// Live members, in no particular order.
    pub fn members(&self) -> Vec<Arc<dyn Job>> {
        let members = match self.inner.members.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        members.values().filter_map(Weak::upgrade).collect()
    }

    pub fn contains(&self, id: JobId) -> bool {
        let members = match self.inner.members.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        members
            .get(&id)
            .is_some_and(|member| member.strong_count() > 0)
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel(&self) {
        info!(group_id = %self.inner.id, "Cancelling job group");
        self.inner.token.cancel();
    }

    pub fn pause(&self) {
        info!(group_id = %self.inner.id, "Pausing job group");
        self.inner.token.pause();
    }

    pub fn resume(&self) {
        info!(group_id = %self.inner.id, "Resuming job group");
        self.inner.token.resume();
    }

    pub fn is_same(&self, other: &JobGroup) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for JobGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobGroup")
            .field("id", &self.inner.id)
            .field("token", &self.inner.token)
            .finish()
    }
}
