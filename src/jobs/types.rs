//! Value types shared by the job engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Process-unique identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobStatus {
    /// Default value before the context is initialized.
    None = 0,
    /// Created and registered, not started yet.
    Created = 1,
    /// The work function is executing.
    Running = 2,
    /// Suspended at a cooperative checkpoint until resumed.
    Paused = 3,
    /// Finished successfully.
    Completed = 4,
    /// Terminally cancelled.
    Cancelled = 5,
    /// The work function returned an error or panicked.
    Failed = 6,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (None, Created) |
            (Created, Running) |
            // From Running
            (Running, Paused) | (Running, Completed) |
            (Running, Failed) | (Running, Cancelled) |
            // From Paused
            (Paused, Running) | (Paused, Cancelled)
        )
    }

    /// Like [`can_transition_to`](Self::can_transition_to) but yields the
    /// error reported for a rejected transition.
    pub fn validate_transition(&self, id: JobId, target: JobStatus) -> Result<(), JobError> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                id,
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Statuses the restart protocol picks back up after a process restart.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Created | Self::Running | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Created,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Completed,
            5 => Self::Cancelled,
            6 => Self::Failed,
            _ => Self::None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A fraction of completed work, always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Percent(f64);

impl Percent {
    pub const ZERO: Percent = Percent(0.0);
    pub const FULL: Percent = Percent(1.0);

    /// Build a percent, clamping into `[0, 1]`. NaN counts as zero.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self::ZERO;
        }
        Self(value.clamp(0.0, 1.0))
    }

    /// `current / max`, clamped. An empty amount of work (`max == 0`) is complete.
    pub fn from_ratio(current: u64, max: u64) -> Self {
        if max == 0 {
            return Self::FULL;
        }
        Self::clamped(current as f64 / max as f64)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.0 * 100.0)
    }
}

/// Progress of a job; `None` while unknown.
pub type Progress = Option<Percent>;
