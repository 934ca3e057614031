//! Persistence layer — durable job state for the restart protocol.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod record;
pub mod traits;

pub use libsql_backend::LibSqlJobStore;
pub use memory::InMemoryJobStore;
pub use record::{PersistedJobState, PersistentJob};
pub use traits::JobStateStore;
