//! Per-task progress view fed by task manager events.
//!
//! The [`ProgressTracker`] subscribes to the manager's event channel and
//! folds events into a concurrent map of current state per content
//! identifier, for UI or monitoring consumption. The persistent index stays
//! the durable source of truth; the tracker is a cheap live view that can be
//! read without touching the database.

use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::index::{IndexError, PersistentIndex, TaskState};
use crate::manager::{TaskEvent, TaskEventKind, TaskManager};

/// Current progress of one task, as last observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    /// Lifecycle state.
    pub state: TaskState,
    /// Bytes present in the cache.
    pub bytes_downloaded: u64,
    /// Expected total size when known.
    pub total_bytes: Option<u64>,
    /// Last error text when the task failed.
    pub last_error: Option<String>,
}

impl TaskProgress {
    /// Completed percentage in `[0.0, 100.0]` when the total size is known.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        let total = self.total_bytes?;
        if total == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some((self.bytes_downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }
}

/// Aggregate task counts across the tracked map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerCounts {
    /// Tasks waiting to be claimed.
    pub queued: usize,
    /// Tasks currently fetching.
    pub downloading: usize,
    /// Tasks held by an explicit pause.
    pub paused: usize,
    /// Fully cached tasks.
    pub completed: usize,
    /// Tasks that exhausted their attempts.
    pub failed: usize,
    /// Removed tasks.
    pub removed: usize,
}

/// Live view of download state per content identifier.
///
/// Created from a [`TaskManager`]; a background task applies the manager's
/// events to the map until [`stop`](Self::stop) is called or the manager is
/// dropped.
#[derive(Debug)]
pub struct ProgressTracker {
    states: Arc<DashMap<String, TaskProgress>>,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProgressTracker {
    /// Creates a tracker subscribed to the manager's events.
    #[must_use]
    #[instrument(skip(manager))]
    pub fn new(manager: &TaskManager) -> Self {
        let states: Arc<DashMap<String, TaskProgress>> = Arc::new(DashMap::new());
        let receiver = manager.subscribe();
        let handle = spawn_listener(Arc::clone(&states), receiver);

        Self {
            states,
            listener: Mutex::new(Some(handle)),
        }
    }

    /// Seeds the view from persisted records.
    ///
    /// Called once after construction so the tracker also covers tasks from
    /// previous process lifetimes, before any event arrives for them.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if listing the index fails.
    #[instrument(skip(self, index))]
    #[allow(clippy::cast_sign_loss)]
    pub async fn prime(&self, index: &PersistentIndex) -> Result<(), IndexError> {
        for record in index.list_all().await? {
            let bytes_downloaded = record.bytes_downloaded.max(0) as u64;
            let total_bytes = record.total_bytes.map(|t| t.max(0) as u64);
            self.states
                .entry(record.content_id.clone())
                .or_insert_with(|| TaskProgress {
                    state: record.state(),
                    bytes_downloaded,
                    total_bytes,
                    last_error: record.last_error.clone(),
                });
        }
        debug!(tracked = self.states.len(), "tracker primed from index");
        Ok(())
    }

    /// Returns the current progress for a content identifier.
    #[must_use]
    pub fn progress(&self, content_id: &str) -> Option<TaskProgress> {
        self.states.get(content_id).map(|entry| entry.value().clone())
    }

    /// Returns all tracked tasks, sorted by content identifier.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, TaskProgress)> {
        let mut entries: Vec<(String, TaskProgress)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Returns aggregate counts by state.
    #[must_use]
    pub fn counts(&self) -> TrackerCounts {
        let mut counts = TrackerCounts::default();
        for entry in self.states.iter() {
            match entry.value().state {
                TaskState::Queued => counts.queued += 1,
                TaskState::Downloading => counts.downloading += 1,
                TaskState::Paused => counts.paused += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Removed => counts.removed += 1,
            }
        }
        counts
    }

    /// Stops the event listener. Idempotent.
    ///
    /// The map keeps its last observed contents and stays readable.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
                debug!("tracker listener stopped");
            }
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns the event-folding task.
fn spawn_listener(
    states: Arc<DashMap<String, TaskProgress>>,
    mut receiver: broadcast::Receiver<TaskEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => apply_event(&states, event),
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The index remains authoritative; a lagged view only
                    // misses intermediate progress values.
                    warn!(skipped, "tracker lagged behind task events");
                }
            }
        }
    })
}

/// Folds one event into the state map.
fn apply_event(states: &DashMap<String, TaskProgress>, event: TaskEvent) {
    let mut entry = states
        .entry(event.content_id)
        .or_insert_with(|| TaskProgress {
            state: TaskState::Queued,
            bytes_downloaded: 0,
            total_bytes: None,
            last_error: None,
        });

    match event.kind {
        TaskEventKind::Queued => {
            entry.state = TaskState::Queued;
            entry.last_error = None;
        }
        TaskEventKind::Started => entry.state = TaskState::Downloading,
        TaskEventKind::Progress {
            bytes_downloaded,
            total_bytes,
        } => {
            entry.state = TaskState::Downloading;
            entry.bytes_downloaded = bytes_downloaded;
            entry.total_bytes = total_bytes;
        }
        TaskEventKind::Completed => entry.state = TaskState::Completed,
        TaskEventKind::Failed { error } => {
            entry.state = TaskState::Failed;
            entry.last_error = Some(error);
        }
        TaskEventKind::Paused => entry.state = TaskState::Paused,
        TaskEventKind::Removed => {
            entry.state = TaskState::Removed;
            entry.bytes_downloaded = 0;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn progress(state: TaskState) -> TaskProgress {
        TaskProgress {
            state,
            bytes_downloaded: 0,
            total_bytes: None,
            last_error: None,
        }
    }

    #[test]
    fn test_percent_requires_known_total() {
        let mut p = progress(TaskState::Downloading);
        assert_eq!(p.percent(), None);

        p.total_bytes = Some(0);
        assert_eq!(p.percent(), None);

        p.bytes_downloaded = 25;
        p.total_bytes = Some(100);
        let pct = p.percent().unwrap();
        assert!((pct - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_apply_event_lifecycle() {
        let states = DashMap::new();
        let id = "https://example.com/clip.mp4";

        apply_event(
            &states,
            TaskEvent {
                content_id: id.to_string(),
                kind: TaskEventKind::Queued,
            },
        );
        assert_eq!(states.get(id).unwrap().state, TaskState::Queued);

        apply_event(
            &states,
            TaskEvent {
                content_id: id.to_string(),
                kind: TaskEventKind::Progress {
                    bytes_downloaded: 512,
                    total_bytes: Some(1024),
                },
            },
        );
        let p = states.get(id).unwrap().clone();
        assert_eq!(p.state, TaskState::Downloading);
        assert_eq!(p.bytes_downloaded, 512);
        assert_eq!(p.total_bytes, Some(1024));

        apply_event(
            &states,
            TaskEvent {
                content_id: id.to_string(),
                kind: TaskEventKind::Failed {
                    error: "HTTP 404".to_string(),
                },
            },
        );
        let p = states.get(id).unwrap().clone();
        assert_eq!(p.state, TaskState::Failed);
        assert_eq!(p.last_error.as_deref(), Some("HTTP 404"));

        // Re-queueing clears the recorded error
        apply_event(
            &states,
            TaskEvent {
                content_id: id.to_string(),
                kind: TaskEventKind::Queued,
            },
        );
        let p = states.get(id).unwrap().clone();
        assert_eq!(p.state, TaskState::Queued);
        assert_eq!(p.last_error, None);
    }

    #[test]
    fn test_apply_event_removed_zeroes_bytes() {
        let states = DashMap::new();
        let id = "https://example.com/clip.mp4";

        apply_event(
            &states,
            TaskEvent {
                content_id: id.to_string(),
                kind: TaskEventKind::Progress {
                    bytes_downloaded: 2048,
                    total_bytes: Some(4096),
                },
            },
        );
        apply_event(
            &states,
            TaskEvent {
                content_id: id.to_string(),
                kind: TaskEventKind::Removed,
            },
        );

        let p = states.get(id).unwrap().clone();
        assert_eq!(p.state, TaskState::Removed);
        assert_eq!(p.bytes_downloaded, 0);
    }

    #[test]
    fn test_counts_by_state() {
        let states = DashMap::new();
        states.insert("a".to_string(), progress(TaskState::Queued));
        states.insert("b".to_string(), progress(TaskState::Queued));
        states.insert("c".to_string(), progress(TaskState::Completed));
        states.insert("d".to_string(), progress(TaskState::Failed));

        let tracker = ProgressTracker {
            states: Arc::new(states),
            listener: Mutex::new(None),
        };

        let counts = tracker.counts();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.downloading, 0);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let states = DashMap::new();
        states.insert("b".to_string(), progress(TaskState::Queued));
        states.insert("a".to_string(), progress(TaskState::Queued));
        states.insert("c".to_string(), progress(TaskState::Queued));

        let tracker = ProgressTracker {
            states: Arc::new(states),
            listener: Mutex::new(None),
        };

        let keys: Vec<String> = tracker.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
