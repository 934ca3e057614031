//! Job engine — cancellable, pausable, observable jobs.

pub mod context;
pub mod events;
pub mod group;
pub mod monitor;
pub mod task;
pub mod token;
pub mod types;

pub use context::{Job, JobContext, JobDefinition, JobDefinitionWithStart, WorkFuture};
pub use events::{EventSource, Subscription};
pub use group::JobGroup;
pub use monitor::{GroupScope, JobChange, JobChangeKind, JobMonitor, JobsView, TypedJobChange};
pub use task::JobTask;
pub use token::{Checkpoint, Interruption, JobCancellationToken};
pub use types::{JobId, JobStatus, Percent, Progress};
