//! On-disk byte cache for downloaded content spans.
//!
//! Payload bytes live in span files under the cache directory; span
//! bookkeeping (which byte ranges of which content id exist, and when they
//! were last read) lives in the shared [`StorageHandle`] so the cache and the
//! persistent index stay on a single writer.
//!
//! # Layout
//!
//! ```text
//! <cache dir>/<sha256(content_id) prefix>/<start_offset>.span
//! ```
//!
//! Content identifiers are arbitrary URIs, so directory names are derived
//! from a hash rather than from the identifier itself.
//!
//! # Eviction
//!
//! The cache is opened with an explicit [`EvictionPolicy`]. The default is
//! [`EvictionPolicy::None`]: nothing is ever deleted and growth is unbounded.

mod evict;

pub use evict::EvictionPolicy;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use sqlx::{FromRow, Row};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument, warn};

use crate::store::StorageHandle;

/// File extension for span payload files.
const SPAN_FILE_EXT: &str = "span";

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem error reading or writing a span file.
    #[error("cache IO error at {path}: {source}")]
    Io {
        /// The file or directory where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Span bookkeeping query failed.
    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CacheError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A recorded byte span for one content identifier.
#[derive(Debug, Clone, FromRow)]
pub struct CacheSpan {
    /// Unique row identifier.
    pub id: i64,
    /// Content identifier this span belongs to.
    pub content_id: String,
    /// First byte offset covered by the span.
    pub start_offset: i64,
    /// Number of bytes in the span.
    pub length: i64,
    /// Span file path relative to the cache directory.
    pub file_name: String,
    /// When the span was written.
    pub created_at: String,
    /// When the span was last read.
    pub last_access: String,
}

impl CacheSpan {
    /// First byte offset past the end of the span.
    #[must_use]
    pub fn end_offset(&self) -> i64 {
        self.start_offset + self.length
    }
}

/// Byte-span storage keyed by content identifier.
///
/// Cloning is cheap; clones share the storage handle and directory and are
/// safe to use from concurrent download tasks (each span write is a distinct
/// file plus one atomic row upsert).
#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
    policy: EvictionPolicy,
    store: StorageHandle,
}

impl ContentCache {
    /// Opens the cache rooted at `dir` with the given eviction policy.
    ///
    /// Creates the directory tree if it does not exist. This is the only
    /// directory-creating side effect of the cache; repeated opens of an
    /// existing directory change nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created.
    #[instrument(skip(store), fields(dir = %dir.display()))]
    pub async fn open(
        dir: &Path,
        policy: EvictionPolicy,
        store: StorageHandle,
    ) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;

        debug!(policy = ?policy, "content cache opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            policy,
            store,
        })
    }

    /// Returns the cache root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the configured eviction policy.
    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Writes one span of bytes for a content identifier.
    ///
    /// The payload is written to its span file first and recorded in the
    /// bookkeeping table second; a bookkeeping failure removes the orphan
    /// file. Writing the same `(content_id, start_offset)` twice replaces
    /// the recorded span. After a successful write the eviction policy is
    /// applied, never evicting spans of the id that was just written.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] on filesystem failure or
    /// [`CacheError::Database`] on bookkeeping failure.
    #[instrument(skip(self, bytes), fields(content_id = %content_id, start_offset, len = bytes.len()))]
    pub async fn write_span(
        &self,
        content_id: &str,
        start_offset: u64,
        bytes: &[u8],
    ) -> Result<(), CacheError> {
        if bytes.is_empty() {
            return Ok(());
        }

        let rel_name = self.span_rel_name(content_id, start_offset);
        let abs_path = self.dir.join(&rel_name);
        if let Some(parent) = abs_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::io(parent.to_path_buf(), e))?;
        }

        tokio::fs::write(&abs_path, bytes)
            .await
            .map_err(|e| CacheError::io(abs_path.clone(), e))?;

        #[allow(clippy::cast_possible_wrap)]
        let insert = sqlx::query(
            r"INSERT INTO cache_spans (content_id, start_offset, length, file_name)
              VALUES (?, ?, ?, ?)
              ON CONFLICT (content_id, start_offset) DO UPDATE SET
                  length = excluded.length,
                  file_name = excluded.file_name,
                  last_access = datetime('now')",
        )
        .bind(content_id)
        .bind(start_offset as i64)
        .bind(bytes.len() as i64)
        .bind(&rel_name)
        .execute(self.store.pool())
        .await;

        if let Err(e) = insert {
            // Don't leave payload files the bookkeeping doesn't know about.
            let _ = tokio::fs::remove_file(&abs_path).await;
            return Err(e.into());
        }

        self.enforce_policy(content_id).await
    }

    /// Reads `len` bytes at `offset` for a content identifier.
    ///
    /// Returns `Some(bytes)` when a single recorded span covers the whole
    /// requested range, updating the span's last-access time; `None`
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the span file is missing or shorter
    /// than its record claims, or [`CacheError::Database`] on query failure.
    #[instrument(skip(self), fields(content_id = %content_id, offset, len))]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub async fn read_span(
        &self,
        content_id: &str,
        offset: u64,
        len: u64,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let span = sqlx::query_as::<_, CacheSpan>(
            r"SELECT * FROM cache_spans
              WHERE content_id = ?
                AND start_offset <= ?
                AND start_offset + length >= ?
              ORDER BY start_offset DESC
              LIMIT 1",
        )
        .bind(content_id)
        .bind(offset as i64)
        .bind((offset + len) as i64)
        .fetch_optional(self.store.pool())
        .await?;

        let Some(span) = span else {
            return Ok(None);
        };

        let abs_path = self.dir.join(&span.file_name);
        let mut file = tokio::fs::File::open(&abs_path)
            .await
            .map_err(|e| CacheError::io(abs_path.clone(), e))?;
        file.seek(std::io::SeekFrom::Start(offset - span.start_offset as u64))
            .await
            .map_err(|e| CacheError::io(abs_path.clone(), e))?;

        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| CacheError::io(abs_path, e))?;

        sqlx::query(r"UPDATE cache_spans SET last_access = datetime('now') WHERE id = ?")
            .bind(span.id)
            .execute(self.store.pool())
            .await?;

        Ok(Some(buf))
    }

    /// Returns the number of contiguous bytes cached from offset zero.
    ///
    /// This is the resume point for the task manager: fetching continues at
    /// the first missing byte.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on query failure.
    #[instrument(skip(self), fields(content_id = %content_id))]
    #[allow(clippy::cast_sign_loss)]
    pub async fn cached_bytes(&self, content_id: &str) -> Result<u64, CacheError> {
        let spans = self.spans(content_id).await?;

        let mut contiguous_end: i64 = 0;
        for span in spans {
            if span.start_offset > contiguous_end {
                break;
            }
            contiguous_end = contiguous_end.max(span.end_offset());
        }

        Ok(contiguous_end.max(0) as u64)
    }

    /// Lists all recorded spans for a content identifier, ordered by offset.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on query failure.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn spans(&self, content_id: &str) -> Result<Vec<CacheSpan>, CacheError> {
        let spans = sqlx::query_as::<_, CacheSpan>(
            r"SELECT * FROM cache_spans WHERE content_id = ? ORDER BY start_offset ASC",
        )
        .bind(content_id)
        .fetch_all(self.store.pool())
        .await?;

        Ok(spans)
    }

    /// Returns true when at least one span exists for the identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on query failure.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn contains(&self, content_id: &str) -> Result<bool, CacheError> {
        let row = sqlx::query(r"SELECT COUNT(*) as count FROM cache_spans WHERE content_id = ?")
            .bind(content_id)
            .fetch_one(self.store.pool())
            .await?;

        Ok(row.get::<i64, _>("count") > 0)
    }

    /// Returns the total number of payload bytes recorded in the cache.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on query failure.
    #[instrument(skip(self))]
    #[allow(clippy::cast_sign_loss)]
    pub async fn total_bytes(&self) -> Result<u64, CacheError> {
        let row = sqlx::query(r"SELECT COALESCE(SUM(length), 0) as total FROM cache_spans")
            .fetch_one(self.store.pool())
            .await?;

        Ok(row.get::<i64, _>("total").max(0) as u64)
    }

    /// Removes all spans (files and records) for a content identifier.
    ///
    /// File deletion is best-effort: a missing span file is logged, not
    /// fatal, since the record removal is what makes the bytes unreachable.
    ///
    /// # Returns
    ///
    /// The number of span records removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on query failure.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn remove(&self, content_id: &str) -> Result<u64, CacheError> {
        let spans = self.spans(content_id).await?;

        for span in &spans {
            let abs_path = self.dir.join(&span.file_name);
            if let Err(e) = tokio::fs::remove_file(&abs_path).await {
                warn!(path = %abs_path.display(), error = %e, "failed to delete span file");
            }
        }

        let result = sqlx::query(r"DELETE FROM cache_spans WHERE content_id = ?")
            .bind(content_id)
            .execute(self.store.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Applies the eviction policy, protecting the given content identifier.
    ///
    /// [`EvictionPolicy::None`] is a no-op. The LRU policy deletes
    /// least-recently-read spans of other identifiers until the cache total
    /// fits the budget; if the protected identifier alone exceeds the
    /// budget, the overshoot is logged and left in place.
    #[allow(clippy::cast_sign_loss)]
    async fn enforce_policy(&self, protected_content_id: &str) -> Result<(), CacheError> {
        let Some(budget) = self.policy.max_total_bytes() else {
            return Ok(());
        };

        let mut total = self.total_bytes().await?;
        if total <= budget {
            return Ok(());
        }

        let candidates = sqlx::query_as::<_, CacheSpan>(
            r"SELECT * FROM cache_spans
              WHERE content_id != ?
              ORDER BY last_access ASC, id ASC",
        )
        .bind(protected_content_id)
        .fetch_all(self.store.pool())
        .await?;

        for span in candidates {
            if total <= budget {
                break;
            }

            sqlx::query(r"DELETE FROM cache_spans WHERE id = ?")
                .bind(span.id)
                .execute(self.store.pool())
                .await?;

            let abs_path = self.dir.join(&span.file_name);
            if let Err(e) = tokio::fs::remove_file(&abs_path).await {
                warn!(path = %abs_path.display(), error = %e, "failed to delete evicted span file");
            }

            total = total.saturating_sub(span.length.max(0) as u64);
            debug!(
                content_id = %span.content_id,
                start_offset = span.start_offset,
                length = span.length,
                remaining_total = total,
                "evicted cache span"
            );
        }

        if total > budget {
            warn!(
                total,
                budget, "cache over budget; active content id alone exceeds it"
            );
        }

        Ok(())
    }

    /// Span file path relative to the cache directory.
    fn span_rel_name(&self, content_id: &str, start_offset: u64) -> String {
        let digest = Sha256::digest(content_id.as_bytes());
        // 8 bytes of the digest is plenty for directory-name uniqueness.
        let dir: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        format!("{dir}/{start_offset}.{SPAN_FILE_EXT}")
    }
}
