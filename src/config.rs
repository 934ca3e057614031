//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::jobs::events::DEFAULT_EVENT_CAPACITY;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// libSQL database holding persisted job state. `None` keeps state in memory.
    pub db_path: Option<PathBuf>,
    /// Buffer size of each job's status/progress channels.
    pub event_capacity: usize,
    /// Buffer size of the monitor's change channel.
    pub change_capacity: usize,
    /// Keep finished jobs in the registry instead of removing them.
    pub retain_finished: bool,
    /// Chunk size of the built-in file copy job.
    pub copy_chunk_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            change_capacity: 256,
            retain_finished: false,
            copy_chunk_bytes: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// Build a config from `JOB_ENGINE_*` environment variables, falling back
    /// to defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: lookup("JOB_ENGINE_DB_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            event_capacity: parse_positive(&lookup, "JOB_ENGINE_EVENT_CAPACITY")?
                .unwrap_or(defaults.event_capacity),
            change_capacity: parse_positive(&lookup, "JOB_ENGINE_CHANGE_CAPACITY")?
                .unwrap_or(defaults.change_capacity),
            retain_finished: parse_bool(&lookup, "JOB_ENGINE_RETAIN_FINISHED")?
                .unwrap_or(defaults.retain_finished),
            copy_chunk_bytes: parse_positive(&lookup, "JOB_ENGINE_COPY_CHUNK_BYTES")?
                .unwrap_or(defaults.copy_chunk_bytes),
        })
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<usize>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match usize::from_str(raw.trim()) {
        Ok(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}
