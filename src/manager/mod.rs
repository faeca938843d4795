//! Task manager for concurrent content downloads with retry support.
//!
//! The [`TaskManager`] coordinates concurrent download tasks using a
//! semaphore-based concurrency control pattern. The persistent index is the
//! durable source of truth for task state; the transport and the content
//! cache move the bytes. Transient failures retry automatically with
//! exponential backoff.
//!
//! # Concurrency Model
//!
//! - Each download runs in its own Tokio task
//! - A semaphore permit is acquired before starting each download
//! - Permits are released automatically when downloads complete (RAII)
//! - The run loop claims records atomically from the index
//!
//! # Retry Behavior
//!
//! - Transient errors (network issues, 5xx) are retried with exponential backoff
//! - Permanent errors (404, 400, invalid URL) fail immediately without retry
//! - Retry-After is honored when servers return 429
//! - The final attempt count is persisted when a task is marked failed
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediadl_core::cache::{ContentCache, EvictionPolicy};
//! use mediadl_core::index::PersistentIndex;
//! use mediadl_core::manager::{ManagerOptions, TaskManager};
//! use mediadl_core::transport::TransportFactory;
//! use mediadl_core::StorageHandle;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StorageHandle::open(Path::new("session.db")).await?;
//! let index = PersistentIndex::new(store.clone());
//! let cache = Arc::new(
//!     ContentCache::open(Path::new("./downloads"), EvictionPolicy::None, store).await?,
//! );
//! let factory = TransportFactory::new("player-app");
//! let manager = TaskManager::new(index, cache, &factory, ManagerOptions::default())?;
//!
//! manager.enqueue("https://example.com/clip.mp4", 0).await?;
//! let stats = manager.run_until_idle().await?;
//! println!("completed: {}, failed: {}", stats.completed(), stats.failed());
//! # Ok(())
//! # }
//! ```

mod retry;

pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{CacheError, ContentCache};
use crate::index::{IndexError, PersistentIndex, TaskRecord, TaskState};
use crate::transport::{Transport, TransportError, TransportFactory};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 32;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default span size buffered before each cache write (4 MiB).
pub const DEFAULT_SPAN_BYTES: usize = 4 * 1024 * 1024;

/// Capacity of the task event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type for task manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Persistent index operation failed.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Content cache operation failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Transport operation failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// What happened to a task, as observed on the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskEventKind {
    /// The task entered (or re-entered) the queue.
    Queued,
    /// A worker claimed the task and began fetching.
    Started,
    /// Byte progress was persisted.
    Progress {
        /// Bytes present in the cache for this task.
        bytes_downloaded: u64,
        /// Expected total size when known.
        total_bytes: Option<u64>,
    },
    /// All bytes are in the cache.
    Completed,
    /// The task failed after all attempts.
    Failed {
        /// Final error text.
        error: String,
    },
    /// The task was paused.
    Paused,
    /// The task and its cached bytes were removed.
    Removed,
}

/// A task lifecycle event emitted by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEvent {
    /// Content identifier of the affected task.
    pub content_id: String,
    /// What happened.
    pub kind: TaskEventKind,
}

/// Statistics from one `run_until_idle` invocation.
///
/// Uses atomic counters for thread-safe updates from concurrent download
/// tasks.
#[derive(Debug, Default)]
pub struct RunStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl RunStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of successfully completed tasks.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Returns the number of failed tasks.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns the total number of tasks processed (completed + failed).
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.failed()
    }

    /// Returns the number of retry attempts made.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }
}

/// Options for constructing a [`TaskManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Maximum number of concurrent downloads (1-32).
    pub concurrency: usize,
    /// Retry policy for failed fetch attempts.
    pub retry_policy: RetryPolicy,
    /// Bytes buffered in memory before each cache span write.
    pub span_bytes: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
            span_bytes: DEFAULT_SPAN_BYTES,
        }
    }
}

/// Orchestrates concurrent download tasks over the session's collaborators.
#[derive(Debug)]
pub struct TaskManager {
    /// Durable task state.
    index: PersistentIndex,
    /// Byte storage for fetched spans.
    cache: Arc<ContentCache>,
    /// HTTP data source built from the session's transport factory.
    transport: Transport,
    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
    /// Configured concurrency limit.
    concurrency: usize,
    /// Retry policy for failed fetch attempts.
    retry_policy: RetryPolicy,
    /// Span buffer size for cache writes.
    span_bytes: usize,
    /// Task lifecycle event channel.
    events: broadcast::Sender<TaskEvent>,
}

impl TaskManager {
    /// Creates a task manager over the given collaborators.
    ///
    /// The manager builds its transport from `factory` at construction, so
    /// a misconfigured HTTP stack surfaces here rather than at first fetch.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::InvalidConcurrency`] if the concurrency is
    /// outside 1-32, or [`ManagerError::Transport`] if the HTTP client
    /// cannot be built.
    #[instrument(skip(index, cache, factory, options), fields(concurrency = options.concurrency))]
    pub fn new(
        index: PersistentIndex,
        cache: Arc<ContentCache>,
        factory: &TransportFactory,
        options: ManagerOptions,
    ) -> Result<Self, ManagerError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&options.concurrency) {
            return Err(ManagerError::InvalidConcurrency {
                value: options.concurrency,
            });
        }

        let transport = factory.create()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        debug!(
            concurrency = options.concurrency,
            max_retries = options.retry_policy.max_attempts(),
            span_bytes = options.span_bytes,
            "creating task manager"
        );

        Ok(Self {
            index,
            cache,
            transport,
            semaphore: Arc::new(Semaphore::new(options.concurrency)),
            concurrency: options.concurrency,
            retry_policy: options.retry_policy,
            span_bytes: options.span_bytes.max(1),
            events,
        })
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Returns the persistent index the manager operates on.
    #[must_use]
    pub fn index(&self) -> &PersistentIndex {
        &self.index
    }

    /// Subscribes to task lifecycle events.
    ///
    /// Slow subscribers may observe `Lagged` on the receiver; events are a
    /// monitoring surface, not the durable record (the index is).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Enqueues a content identifier for download.
    ///
    /// Idempotent for already queued/downloading identifiers; revives
    /// paused/failed/removed ones. The identifier must be a valid URL.
    ///
    /// # Returns
    ///
    /// The numeric id of the underlying task record.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Transport`] for invalid URLs and
    /// [`ManagerError::Index`] if persistence fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn enqueue(&self, content_id: &str, priority: i64) -> Result<i64, ManagerError> {
        Url::parse(content_id).map_err(|_| TransportError::invalid_url(content_id))?;

        let already_active = self.index.active_exists(content_id).await?;
        let id = self.index.upsert_queued(content_id, priority).await?;
        if !already_active {
            self.emit(content_id, TaskEventKind::Queued);
        }
        Ok(id)
    }

    /// Pauses a queued task.
    ///
    /// A task currently downloading finishes its in-flight attempt; pausing
    /// affects claiming, not mid-attempt transfers.
    ///
    /// # Returns
    ///
    /// `true` when the task transitioned to paused.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Index`] if no record exists or persistence
    /// fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn pause(&self, content_id: &str) -> Result<bool, ManagerError> {
        let paused = self.index.mark_paused(content_id).await?;
        if paused {
            self.emit(content_id, TaskEventKind::Paused);
        }
        Ok(paused)
    }

    /// Returns a paused or failed task to the queue.
    ///
    /// # Returns
    ///
    /// `true` when the task transitioned back to queued.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Index`] if no record exists or persistence
    /// fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn resume(&self, content_id: &str) -> Result<bool, ManagerError> {
        let resumed = self.index.requeue(content_id).await?;
        if resumed {
            self.emit(content_id, TaskEventKind::Queued);
        }
        Ok(resumed)
    }

    /// Removes a task and purges its cached bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Index`] if no record exists, or
    /// [`ManagerError::Cache`] if purging spans fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn remove(&self, content_id: &str) -> Result<(), ManagerError> {
        // Record first: once removed, no worker claims it and a finishing
        // worker's completion is ignored by the state guard.
        self.index.mark_removed(content_id).await?;
        self.cache.remove(content_id).await?;
        self.emit(content_id, TaskEventKind::Removed);
        Ok(())
    }

    /// Returns the current record for a content identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Index`] if the query fails.
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn status(&self, content_id: &str) -> Result<Option<TaskRecord>, ManagerError> {
        Ok(self.index.get(content_id).await?)
    }

    /// Lists task records, optionally filtered by state.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Index`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>, ManagerError> {
        let records = match state {
            Some(state) => self.index.list_by_state(state).await?,
            None => self.index.list_all().await?,
        };
        Ok(records)
    }

    /// Processes all queued tasks concurrently until none remain.
    ///
    /// This method:
    /// 1. Claims records atomically from the index
    /// 2. Spawns download tasks up to the concurrency limit
    /// 3. Retries transient failures with exponential backoff
    /// 4. Updates index state on completion/failure
    /// 5. Returns statistics when all spawned downloads finish
    ///
    /// Note: Individual task failures do NOT cause this method to error.
    /// Failed tasks are marked in the index and counted in the stats.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Index`] if claiming fails, or
    /// [`ManagerError::SemaphoreClosed`] if the semaphore is closed.
    #[instrument(skip(self))]
    pub async fn run_until_idle(&self) -> Result<RunStats, ManagerError> {
        let stats = Arc::new(RunStats::new());
        let mut handles = Vec::new();

        info!("starting task run");

        // Keep claiming until no more queued records
        loop {
            let Some(record) = self.index.claim_next().await? else {
                break; // Nothing left to claim
            };

            debug!(task_id = record.id, content_id = %record.content_id, "claimed task");

            // Acquire semaphore permit (blocks if at concurrency limit)
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ManagerError::SemaphoreClosed)?;

            // Clone values for the spawned task
            let worker = Worker {
                index: self.index.clone(),
                cache: Arc::clone(&self.cache),
                transport: self.transport.clone(),
                retry_policy: self.retry_policy.clone(),
                span_bytes: self.span_bytes,
                events: self.events.clone(),
            };
            let stats = Arc::clone(&stats);

            handles.push(tokio::spawn(async move {
                // Permit is dropped when this block exits (RAII)
                let _permit = permit;
                worker.execute(record, &stats).await;
            }));
        }

        debug!(task_count = handles.len(), "waiting for downloads to finish");

        // Wait for all tasks to complete
        for handle in handles {
            // Task panics are logged but don't fail the run
            if let Err(e) = handle.await {
                warn!(error = %e, "download task panicked");
            }
        }

        let completed = stats.completed();
        let failed = stats.failed();
        let retried = stats.retried();
        info!(
            completed,
            failed,
            retried,
            total = completed + failed,
            "task run complete"
        );

        // All tasks are done, so we should have sole ownership of the Arc.
        match Arc::try_unwrap(stats) {
            Ok(stats) => Ok(stats),
            Err(arc_stats) => {
                // Fallback: rebuild from the atomic values
                let new_stats = RunStats::new();
                new_stats
                    .completed
                    .store(arc_stats.completed(), Ordering::SeqCst);
                new_stats.failed.store(arc_stats.failed(), Ordering::SeqCst);
                new_stats
                    .retried
                    .store(arc_stats.retried(), Ordering::SeqCst);
                Ok(new_stats)
            }
        }
    }

    fn emit(&self, content_id: &str, kind: TaskEventKind) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.events.send(TaskEvent {
            content_id: content_id.to_string(),
            kind,
        });
    }
}

/// Everything one spawned download needs, cloned out of the manager.
struct Worker {
    index: PersistentIndex,
    cache: Arc<ContentCache>,
    transport: Transport,
    retry_policy: RetryPolicy,
    span_bytes: usize,
    events: broadcast::Sender<TaskEvent>,
}

impl Worker {
    /// Runs one claimed task to completion or final failure.
    #[instrument(skip(self, record, stats), fields(task_id = record.id, content_id = %record.content_id))]
    async fn execute(&self, record: TaskRecord, stats: &RunStats) {
        let content_id = record.content_id.clone();
        self.emit(&content_id, TaskEventKind::Started);

        match self.fetch_with_retry(&content_id, stats).await {
            Ok(bytes) => {
                info!(content_id = %content_id, bytes, "download completed");
                // Best-effort status update - don't crash if it fails
                match self.index.mark_completed(&content_id).await {
                    Ok(true) => {
                        self.emit(&content_id, TaskEventKind::Completed);
                        stats.increment_completed();
                    }
                    Ok(false) => {
                        debug!(content_id = %content_id, "task left downloading state; skipping completion");
                    }
                    Err(e) => {
                        warn!(content_id = %content_id, error = %e, "failed to mark task completed");
                        stats.increment_completed();
                    }
                }
            }
            Err((e, attempts)) => {
                warn!(
                    content_id = %content_id,
                    error = %e,
                    attempts,
                    "download failed after all attempts"
                );
                let error_text = e.to_string();
                if let Err(qe) = self
                    .index
                    .mark_failed(&content_id, &error_text, i64::from(attempts))
                    .await
                {
                    warn!(content_id = %content_id, error = %qe, "failed to mark task failed");
                }
                self.emit(&content_id, TaskEventKind::Failed { error: error_text });
                stats.increment_failed();
            }
        }
    }

    /// Fetches a task with retry logic for transient errors.
    ///
    /// Retry attempts are tracked in-memory during the retry loop. Only the
    /// final error and attempt count are returned when retries are
    /// exhausted.
    async fn fetch_with_retry(
        &self,
        content_id: &str,
        stats: &RunStats,
    ) -> Result<u64, (ManagerError, u32)> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(attempt, "attempting fetch");

            match self.fetch_once(content_id).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    // Infra failures (index/cache) are never retryable here;
                    // transport failures classify by kind.
                    let (failure_type, retry_after_delay) = match &e {
                        ManagerError::Transport(te) => {
                            let failure_type = classify_error(te);
                            let delay = match te {
                                TransportError::HttpStatus {
                                    retry_after: Some(value),
                                    ..
                                } if failure_type == FailureType::RateLimited => {
                                    parse_retry_after(value)
                                }
                                _ => None,
                            };
                            (failure_type, delay)
                        }
                        _ => (FailureType::Permanent, None),
                    };

                    match self.retry_policy.should_retry(failure_type, attempt) {
                        RetryDecision::Retry {
                            delay: backoff_delay,
                            attempt: next_attempt,
                        } => {
                            // Prefer the server-mandated delay over backoff
                            let delay = retry_after_delay.unwrap_or(backoff_delay);

                            info!(
                                content_id = %content_id,
                                attempt = next_attempt,
                                max_attempts = self.retry_policy.max_attempts(),
                                delay_ms = delay.as_millis(),
                                using_retry_after = retry_after_delay.is_some(),
                                error = %e,
                                "retrying fetch"
                            );
                            stats.increment_retried();
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(content_id = %content_id, %reason, "not retrying fetch");
                            return Err((e, attempt));
                        }
                    }
                }
            }
        }
    }

    /// One fetch attempt: resume from the cache's contiguous prefix, stream
    /// the body into span-sized cache writes, persist progress per span.
    ///
    /// # Returns
    ///
    /// Total contiguous bytes cached for the task after this attempt.
    async fn fetch_once(&self, content_id: &str) -> Result<u64, ManagerError> {
        let offset = self.cache.cached_bytes(content_id).await?;

        let mut fetch = match self.transport.fetch_from(content_id, offset).await {
            Ok(fetch) => fetch,
            // Requesting a range at/past EOF means every byte is already
            // cached (e.g. a crash after the last span but before the
            // completed mark).
            Err(TransportError::HttpStatus { status: 416, .. }) if offset > 0 => {
                debug!(content_id = %content_id, offset, "range at EOF; treating as complete");
                return Ok(offset);
            }
            Err(e) => return Err(e.into()),
        };

        let mut write_offset = if fetch.resumed() { offset } else { 0 };
        if !fetch.resumed() && offset > 0 {
            // Server replayed from byte zero; stale spans would corrupt the
            // contiguity bookkeeping.
            debug!(content_id = %content_id, "server ignored range; discarding cached spans");
            self.cache.remove(content_id).await?;
        }

        let total_bytes = fetch.total_length();
        self.update_progress(content_id, write_offset, total_bytes)
            .await?;

        let mut buf: Vec<u8> = Vec::with_capacity(self.span_bytes.min(DEFAULT_SPAN_BYTES));
        while let Some(chunk) = fetch.next_chunk().await? {
            buf.extend_from_slice(&chunk);

            if buf.len() >= self.span_bytes {
                self.cache
                    .write_span(content_id, write_offset, &buf)
                    .await?;
                write_offset += buf.len() as u64;
                buf.clear();
                self.update_progress(content_id, write_offset, total_bytes)
                    .await?;
            }
        }

        if !buf.is_empty() {
            self.cache
                .write_span(content_id, write_offset, &buf)
                .await?;
            write_offset += buf.len() as u64;
        }

        self.update_progress(content_id, write_offset, total_bytes)
            .await?;

        Ok(write_offset)
    }

    /// Persists byte progress and mirrors it onto the event channel.
    async fn update_progress(
        &self,
        content_id: &str,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) -> Result<(), ManagerError> {
        #[allow(clippy::cast_possible_wrap)]
        self.index
            .update_progress(
                content_id,
                bytes_downloaded as i64,
                total_bytes.map(|t| t as i64),
            )
            .await?;
        self.emit(
            content_id,
            TaskEventKind::Progress {
                bytes_downloaded,
                total_bytes,
            },
        );
        Ok(())
    }

    fn emit(&self, content_id: &str, kind: TaskEventKind) {
        let _ = self.events.send(TaskEvent {
            content_id: content_id.to_string(),
            kind,
        });
    }
}
