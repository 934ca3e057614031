//! Built-in job types.

pub mod file_copy;

pub use file_copy::{FileCopyJob, FileCopyWorker};
