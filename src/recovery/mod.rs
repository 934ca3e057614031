//! Restart recovery — workers and the restart protocol.

pub mod restart;
pub mod worker;

pub use restart::{JobRestarter, RestartReport};
pub use worker::{DefinitionWorker, JobWorker, WorkerRegistry};
