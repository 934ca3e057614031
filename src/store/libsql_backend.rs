//! libSQL backend — async `JobStateStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::jobs::types::{JobId, JobStatus};
use crate::store::migrations;
use crate::store::record::PersistedJobState;
use crate::store::traits::JobStateStore;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_state(row: &libsql::Row) -> Result<PersistedJobState, StoreError> {
    let read = |e: libsql::Error| StoreError::Query(format!("job_states row parse: {e}"));

    let job_id: String = row.get(0).map_err(read)?;
    let job_type: String = row.get(1).map_err(read)?;
    let status: String = row.get(2).map_err(read)?;
    let payload: String = row.get(3).map_err(read)?;
    let updated_at: String = row.get(4).map_err(read)?;

    Ok(PersistedJobState {
        job_id: job_id
            .parse()
            .map_err(|e| StoreError::Serialization(format!("job_id {job_id}: {e}")))?,
        job_type,
        status: status
            .parse::<JobStatus>()
            .map_err(StoreError::Serialization)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::Serialization(format!("payload of {job_id}: {e}")))?,
        updated_at: parse_datetime(&updated_at),
    })
}

const STATE_COLUMNS: &str = "job_id, job_type, status, payload, updated_at";

#[async_trait]
impl JobStateStore for LibSqlJobStore {
    async fn save(&self, state: &PersistedJobState) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&state.payload)
            .map_err(|e| StoreError::Serialization(format!("save payload: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO job_states (job_id, job_type, status, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(job_id) DO UPDATE SET
                    job_type = excluded.job_type,
                    status = excluded.status,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                params![
                    state.job_id.to_string(),
                    state.job_type.clone(),
                    state.status.as_str(),
                    payload,
                    state.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save: {e}")))?;

        debug!(job_id = %state.job_id, status = %state.status, "Job state saved");
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<PersistedJobState>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {STATE_COLUMNS} FROM job_states WHERE job_id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_state(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get: {e}"))),
        }
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM job_states WHERE job_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete: {e}")))?;

        debug!(job_id = %id, "Job state deleted");
        Ok(affected > 0)
    }

    async fn load_unfinished(&self) -> Result<Vec<PersistedJobState>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM job_states
                     WHERE status IN ('created', 'running', 'paused')
                     ORDER BY updated_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("load_unfinished: {e}")))?;

        let mut states = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => states.push(row_to_state(&row)?),
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("load_unfinished: {e}"))),
            }
        }
        Ok(states)
    }
}
