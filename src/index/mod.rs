//! Persistent index of download task state.
//!
//! This module provides the `SQLite`-backed durable record of every download
//! task, keyed by content identifier, through its lifecycle
//! (queued → downloading → completed/failed/removed, with an explicit paused
//! holding state).
//!
//! # Overview
//!
//! The index consists of:
//! - [`PersistentIndex`] - Main interface for index operations
//! - [`TaskRecord`] - Individual durable task entry
//! - [`TaskState`] - Task lifecycle states
//! - [`IndexError`] - Operation error types
//!
//! # Example
//!
//! ```ignore
//! use mediadl_core::index::{PersistentIndex, TaskState};
//! use mediadl_core::StorageHandle;
//!
//! let store = StorageHandle::open(Path::new("session.db")).await?;
//! let index = PersistentIndex::new(store);
//!
//! index.upsert_queued("https://example.com/clip.mp4", 0).await?;
//! if let Some(record) = index.claim_next().await? {
//!     // ... fetch the content ...
//!     index.mark_completed(&record.content_id).await?;
//! }
//! ```

mod error;
mod record;

pub use error::{IndexDbErrorKind, IndexError};
pub use record::{TaskRecord, TaskState};

use crate::store::StorageHandle;
use sqlx::Row;
use tracing::instrument;

/// Result type for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Default priority for new task records.
const DEFAULT_PRIORITY: i64 = 0;

/// Returns `Ok(())` if at least one row was affected; otherwise [`IndexError::TaskNotFound`].
fn check_affected(content_id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(IndexError::TaskNotFound(content_id.to_string()))
    } else {
        Ok(())
    }
}

/// Durable key→task-state mapping for the download session.
///
/// All mutations are single atomic statements so concurrent task-manager
/// workers never observe half-applied transitions.
#[derive(Debug, Clone)]
pub struct PersistentIndex {
    store: StorageHandle,
}

impl PersistentIndex {
    /// Creates an index over the given storage handle.
    #[must_use]
    pub fn new(store: StorageHandle) -> Self {
        Self { store }
    }

    /// Enqueues a content identifier, reviving terminal records.
    ///
    /// Behavior by current state:
    /// - no record: a new `queued` record is inserted
    /// - `paused`, `failed`, `removed`: revived to `queued` (a revived
    ///   `removed` record restarts from zero bytes since its cache spans
    ///   were purged)
    /// - `queued`, `downloading`, `completed`: left untouched
    ///
    /// # Returns
    ///
    /// The numeric id of the task record.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if a statement fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn upsert_queued(&self, content_id: &str, priority: i64) -> Result<i64> {
        sqlx::query(
            r"UPDATE tasks
              SET state = ?,
                  priority = ?,
                  attempts = 0,
                  last_error = NULL,
                  bytes_downloaded = CASE WHEN state = ? THEN 0 ELSE bytes_downloaded END,
                  updated_at = datetime('now')
              WHERE content_id = ? AND state IN (?, ?, ?)",
        )
        .bind(TaskState::Queued.as_str())
        .bind(priority)
        .bind(TaskState::Removed.as_str())
        .bind(content_id)
        .bind(TaskState::Paused.as_str())
        .bind(TaskState::Failed.as_str())
        .bind(TaskState::Removed.as_str())
        .execute(self.store.pool())
        .await?;

        sqlx::query(
            r"INSERT INTO tasks (content_id, state, priority)
              VALUES (?, ?, ?)
              ON CONFLICT (content_id) DO NOTHING",
        )
        .bind(content_id)
        .bind(TaskState::Queued.as_str())
        .bind(priority)
        .execute(self.store.pool())
        .await?;

        let row = sqlx::query(r"SELECT id FROM tasks WHERE content_id = ?")
            .bind(content_id)
            .fetch_one(self.store.pool())
            .await?;

        Ok(row.get("id"))
    }

    /// Retrieves and claims the next queued task for processing.
    ///
    /// Atomically transitions the highest-priority queued record to
    /// `downloading` and returns it. Returns `None` when nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn claim_next(&self) -> Result<Option<TaskRecord>> {
        // Atomic UPDATE...RETURNING ensures no race condition between select and update
        let record = sqlx::query_as::<_, TaskRecord>(
            r"UPDATE tasks
              SET state = ?, updated_at = datetime('now')
              WHERE id = (
                  SELECT id FROM tasks
                  WHERE state = ?
                  ORDER BY priority DESC, created_at ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .bind(TaskState::Downloading.as_str())
        .bind(TaskState::Queued.as_str())
        .fetch_optional(self.store.pool())
        .await?;

        Ok(record)
    }

    /// Marks a downloading task as successfully completed.
    ///
    /// Only `downloading` records transition. Returns `Ok(false)` when the
    /// record exists but left the `downloading` state underneath the worker
    /// (a concurrent remove), so completion never resurrects a removed task.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::TaskNotFound`] if no record exists for the id.
    /// Returns [`IndexError::Database`] if the update fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn mark_completed(&self, content_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?, updated_at = datetime('now')
              WHERE content_id = ? AND state = ?",
        )
        .bind(TaskState::Completed.as_str())
        .bind(content_id)
        .bind(TaskState::Downloading.as_str())
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.require_exists(content_id).await?;
        Ok(false)
    }

    /// Marks a downloading task as failed with an error message and attempt
    /// count.
    ///
    /// Only `downloading` records transition; see
    /// [`mark_completed`](Self::mark_completed) for the race this guards.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::TaskNotFound`] if no record exists for the id.
    /// Returns [`IndexError::Database`] if the update fails.
    #[instrument(skip(self), fields(content_id = %content_id, error = %error, attempts))]
    pub async fn mark_failed(&self, content_id: &str, error: &str, attempts: i64) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?,
                  attempts = ?,
                  last_error = ?,
                  updated_at = datetime('now')
              WHERE content_id = ? AND state = ?",
        )
        .bind(TaskState::Failed.as_str())
        .bind(attempts)
        .bind(error)
        .bind(content_id)
        .bind(TaskState::Downloading.as_str())
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.require_exists(content_id).await?;
        Ok(false)
    }

    /// Pauses a queued task.
    ///
    /// Only `queued` records transition; a record in any other state is left
    /// untouched and `Ok(false)` is returned so the caller can distinguish
    /// "paused" from "nothing to pause".
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::TaskNotFound`] if no record exists for the id.
    /// Returns [`IndexError::Database`] if the update fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn mark_paused(&self, content_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?, updated_at = datetime('now')
              WHERE content_id = ? AND state = ?",
        )
        .bind(TaskState::Paused.as_str())
        .bind(content_id)
        .bind(TaskState::Queued.as_str())
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.require_exists(content_id).await?;
        Ok(false)
    }

    /// Returns a paused or failed task to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::TaskNotFound`] if no record exists for the id.
    /// Returns [`IndexError::Database`] if the update fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn requeue(&self, content_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?, last_error = NULL, updated_at = datetime('now')
              WHERE content_id = ? AND state IN (?, ?)",
        )
        .bind(TaskState::Queued.as_str())
        .bind(content_id)
        .bind(TaskState::Paused.as_str())
        .bind(TaskState::Failed.as_str())
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.require_exists(content_id).await?;
        Ok(false)
    }

    /// Marks a task as removed.
    ///
    /// The caller is responsible for purging the task's cache spans.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::TaskNotFound`] if no record exists for the id.
    /// Returns [`IndexError::Database`] if the update fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn mark_removed(&self, content_id: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?, bytes_downloaded = 0, updated_at = datetime('now')
              WHERE content_id = ?",
        )
        .bind(TaskState::Removed.as_str())
        .bind(content_id)
        .execute(self.store.pool())
        .await?;

        check_affected(content_id, result.rows_affected())
    }

    /// Updates byte progress for a task.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::TaskNotFound`] if no record exists for the id.
    /// Returns [`IndexError::Database`] if the update fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn update_progress(
        &self,
        content_id: &str,
        bytes_downloaded: i64,
        total_bytes: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET bytes_downloaded = ?, total_bytes = ?, updated_at = datetime('now')
              WHERE content_id = ?",
        )
        .bind(bytes_downloaded)
        .bind(total_bytes)
        .bind(content_id)
        .execute(self.store.pool())
        .await?;

        check_affected(content_id, result.rows_affected())
    }

    /// Gets a task record by content identifier.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if the query fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn get(&self, content_id: &str) -> Result<Option<TaskRecord>> {
        let record = sqlx::query_as::<_, TaskRecord>(r"SELECT * FROM tasks WHERE content_id = ?")
            .bind(content_id)
            .fetch_optional(self.store.pool())
            .await?;

        Ok(record)
    }

    /// Counts tasks by state.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_state(&self, state: TaskState) -> Result<i64> {
        let result = sqlx::query(r"SELECT COUNT(*) as count FROM tasks WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(self.store.pool())
            .await?;

        Ok(result.get("count"))
    }

    /// Checks whether a content id already has a queued or downloading record.
    ///
    /// Used to keep `enqueue` idempotent for in-flight identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if the query fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn active_exists(&self, content_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"SELECT COUNT(*) as count FROM tasks
              WHERE content_id = ? AND state IN (?, ?)",
        )
        .bind(content_id)
        .bind(TaskState::Queued.as_str())
        .bind(TaskState::Downloading.as_str())
        .fetch_one(self.store.pool())
        .await?;

        Ok(result.get::<i64, _>("count") > 0)
    }

    /// Resets all `downloading` records back to `queued`.
    ///
    /// Called at session startup for crash recovery - records left
    /// `downloading` by a previous process are returned to the queue.
    ///
    /// # Returns
    ///
    /// The number of records that were reset.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_downloading(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?, updated_at = datetime('now')
              WHERE state = ?",
        )
        .bind(TaskState::Queued.as_str())
        .bind(TaskState::Downloading.as_str())
        .execute(self.store.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Lists tasks filtered by state, ordered by priority then age.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_state(&self, state: TaskState) -> Result<Vec<TaskRecord>> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r"SELECT * FROM tasks
              WHERE state = ?
              ORDER BY priority DESC, created_at ASC",
        )
        .bind(state.as_str())
        .fetch_all(self.store.pool())
        .await?;

        Ok(records)
    }

    /// Lists all task records, ordered by priority then age.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<TaskRecord>> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r"SELECT * FROM tasks ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(self.store.pool())
        .await?;

        Ok(records)
    }

    /// Errors with [`IndexError::TaskNotFound`] unless a record exists.
    async fn require_exists(&self, content_id: &str) -> Result<()> {
        let result = sqlx::query(r"SELECT COUNT(*) as count FROM tasks WHERE content_id = ?")
            .bind(content_id)
            .fetch_one(self.store.pool())
            .await?;
        if result.get::<i64, _>("count") == 0 {
            return Err(IndexError::TaskNotFound(content_id.to_string()));
        }
        Ok(())
    }
}
