//! Task record types and state definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a tracked download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be picked up by the task manager.
    Queued,
    /// Currently being fetched.
    Downloading,
    /// Held back by an explicit pause; not eligible for claiming.
    Paused,
    /// All bytes are in the cache.
    Completed,
    /// Failed after all retry attempts were exhausted.
    Failed,
    /// Removed by the caller; cache spans have been purged.
    Removed,
}

impl TaskState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }

    /// Returns true for states the claim loop may still act on.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Downloading)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "removed" => Ok(Self::Removed),
            _ => Err(format!("invalid task state: {s}")),
        }
    }
}

/// A single durable task record in the persistent index.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    /// Unique row identifier.
    pub id: i64,
    /// Content identifier (the URI this task downloads).
    pub content_id: String,
    /// Current lifecycle state (stored as text, parsed via `state()`).
    #[sqlx(rename = "state")]
    pub state_str: String,
    /// Higher priority tasks are claimed first (default 0).
    pub priority: i64,
    /// Number of fetch attempts made so far.
    pub attempts: i64,
    /// Last error message if the task failed.
    pub last_error: Option<String>,
    /// Bytes currently present in the cache for this task.
    pub bytes_downloaded: i64,
    /// Expected total bytes when known (from Content-Length).
    pub total_bytes: Option<i64>,
    /// When the record was created.
    pub created_at: String,
    /// When the record was last updated.
    pub updated_at: String,
}

impl TaskRecord {
    /// Returns the parsed state enum.
    ///
    /// Falls back to `Queued` if the stored string is invalid.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state_str.parse().unwrap_or(TaskState::Queued)
    }

    /// Completed fraction in `[0.0, 1.0]` when the total size is known.
    #[must_use]
    pub fn fraction_downloaded(&self) -> Option<f64> {
        let total = self.total_bytes?;
        if total <= 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some((self.bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0))
    }
}
