//! Job Engine — cancellable, pausable, persistent background jobs.

pub mod builtin;
pub mod config;
pub mod error;
pub mod jobs;
pub mod recovery;
pub mod store;
