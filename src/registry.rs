//! Download session registry: one consistent collaborator graph per root.
//!
//! The [`SessionRegistry`] is an explicit dependency-injection container: it
//! builds the storage handle, persistent index, content cache, transport
//! factory, task manager and progress tracker exactly once, in dependency
//! order, and hands them out fully constructed. There is no lazily-triggered
//! global and no double-checked locking; a process-wide guard keyed by the
//! resolved content root makes concurrent opens of the same root converge on
//! one instance.
//!
//! Two independent registries over the same directory would mean two writers
//! on the same index database and cache files, so the guard holds weak
//! references: one live instance per root, reopenable once dropped or shut
//! down.
//!
//! # Example
//!
//! ```no_run
//! use mediadl_core::{SessionConfig, SessionRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("/var/lib/player").with_client_id("player-app");
//! let session = SessionRegistry::open(config).await?;
//!
//! session.task_manager().enqueue("https://example.com/clip.mp4", 0).await?;
//! session.task_manager().run_until_idle().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::cache::{CacheError, ContentCache};
use crate::config::SessionConfig;
use crate::index::{IndexError, PersistentIndex};
use crate::manager::{ManagerError, TaskManager};
use crate::store::{StorageHandle, StoreError};
use crate::tracker::ProgressTracker;
use crate::transport::TransportFactory;

/// Directory created under the chosen storage root for all session files.
const DOWNLOAD_CONTENT_DIR: &str = "downloads";

/// Index database file name inside the content root.
const INDEX_FILE_NAME: &str = "index.db";

/// Probe file written (and removed) to test root writability.
const WRITE_PROBE_FILE: &str = ".mediadl-probe";

/// Process-wide registry of open sessions (content root -> weak reference).
///
/// The async mutex is held across construction, so exactly one caller builds
/// a session for a given root and everyone else observes the finished value.
static OPEN_SESSIONS: Lazy<Mutex<HashMap<PathBuf, Weak<SessionRegistry>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Errors that can occur while opening a session.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Neither the primary nor the fallback storage root is writable.
    #[error("no writable storage root available (tried {tried:?})")]
    StorageUnavailable {
        /// The roots that were probed, in order.
        tried: Vec<PathBuf>,
    },

    /// The index database exists but cannot be opened or migrated.
    #[error("persistent index at {path} exists but cannot be opened: {source}")]
    IndexCorrupt {
        /// Path of the unreadable database file.
        path: PathBuf,
        /// The underlying storage error.
        #[source]
        source: StoreError,
    },

    /// Storage failed on a fresh (non-existing) index path.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Content cache construction failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Persistent index operation failed during construction.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Task manager construction failed.
    #[error("task manager error: {0}")]
    Manager(#[from] ManagerError),
}

/// A fully-constructed set of download-session collaborators.
///
/// Every accessor returns the instance built at open time; nothing is
/// reconstructed per call.
#[derive(Debug)]
pub struct SessionRegistry {
    content_root: PathBuf,
    storage: StorageHandle,
    index: PersistentIndex,
    cache: Arc<ContentCache>,
    transport_factory: TransportFactory,
    task_manager: Arc<TaskManager>,
    tracker: ProgressTracker,
}

impl SessionRegistry {
    /// Opens the session for the storage root the config resolves to.
    ///
    /// Safe under concurrent first-call from many tasks: exactly one caller
    /// constructs; all callers receive the identical `Arc`. A root whose
    /// session was dropped or shut down can be opened again.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::StorageUnavailable`] when no root is
    /// writable, [`RegistryError::IndexCorrupt`] when an existing index
    /// database cannot be opened, and the remaining variants for
    /// construction failures of the individual collaborators.
    #[instrument(skip(config), fields(client_id = %config.client_id))]
    pub async fn open(config: SessionConfig) -> Result<Arc<Self>, RegistryError> {
        let content_root =
            resolve_content_root(config.primary_root.as_deref(), &config.fallback_root)?;

        let mut sessions = OPEN_SESSIONS.lock().await;

        if let Some(existing) = sessions.get(&content_root).and_then(Weak::upgrade) {
            debug!(content_root = %content_root.display(), "returning existing session");
            return Ok(existing);
        }

        // Construction happens under the lock: no second builder, and no
        // caller ever sees a partially-built session.
        let session = Arc::new(Self::build(content_root.clone(), &config).await?);

        sessions.retain(|_, weak| weak.strong_count() > 0);
        sessions.insert(content_root, Arc::downgrade(&session));

        Ok(session)
    }

    /// Builds the collaborator graph in dependency order.
    async fn build(content_root: PathBuf, config: &SessionConfig) -> Result<Self, RegistryError> {
        // 1. Storage handle, shared by index and cache.
        let index_path = content_root.join(INDEX_FILE_NAME);
        let index_existed = index_path.exists();
        let storage = match StorageHandle::open(&index_path).await {
            Ok(storage) => storage,
            Err(source) if index_existed => {
                return Err(RegistryError::IndexCorrupt {
                    path: index_path,
                    source,
                });
            }
            Err(source) => return Err(source.into()),
        };

        // 2. Persistent index, with crash recovery for stale claims.
        let index = PersistentIndex::new(storage.clone());
        let recovered = index.reset_downloading().await?;
        if recovered > 0 {
            info!(recovered, "requeued tasks left downloading by a previous process");
        }

        // 3. Content cache on the same storage handle and root.
        let cache = Arc::new(
            ContentCache::open(&content_root, config.eviction, storage.clone()).await?,
        );

        // 4. Transport factory with the session's fixed client identifier.
        let transport_factory = TransportFactory::with_timeouts(
            config.client_id.clone(),
            config.connect_timeout_secs,
            config.read_timeout_secs,
        );

        // 5. Task manager over index + cache + transport.
        let task_manager = Arc::new(TaskManager::new(
            index.clone(),
            Arc::clone(&cache),
            &transport_factory,
            config.manager_options(),
        )?);

        // 6. Progress tracker observing the manager, primed from the index.
        let tracker = ProgressTracker::new(&task_manager);
        tracker.prime(&index).await?;

        info!(content_root = %content_root.display(), "download session ready");

        Ok(Self {
            content_root,
            storage,
            index,
            cache,
            transport_factory,
            task_manager,
            tracker,
        })
    }

    /// The resolved content root (`<storage root>/downloads`).
    #[must_use]
    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    /// The shared storage handle.
    #[must_use]
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    /// The persistent task index.
    #[must_use]
    pub fn index(&self) -> &PersistentIndex {
        &self.index
    }

    /// The content cache.
    #[must_use]
    pub fn cache(&self) -> Arc<ContentCache> {
        Arc::clone(&self.cache)
    }

    /// The transport factory.
    #[must_use]
    pub fn transport_factory(&self) -> &TransportFactory {
        &self.transport_factory
    }

    /// The task manager.
    #[must_use]
    pub fn task_manager(&self) -> Arc<TaskManager> {
        Arc::clone(&self.task_manager)
    }

    /// The progress tracker.
    #[must_use]
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Shuts the session down: stops the tracker listener and closes the
    /// storage pool. Idempotent.
    ///
    /// The root becomes openable again afterwards; in-flight database
    /// operations on clones of the storage handle will fail once the pool
    /// closes, so drain the task manager first.
    #[instrument(skip(self), fields(content_root = %self.content_root.display()))]
    pub async fn shutdown(&self) {
        self.tracker.stop();
        self.storage.close().await;

        let mut sessions = OPEN_SESSIONS.lock().await;
        let is_this_instance = sessions
            .get(&self.content_root)
            .and_then(Weak::upgrade)
            .map_or(true, |live| std::ptr::eq(live.as_ref(), self));
        if is_this_instance {
            sessions.remove(&self.content_root);
        }

        info!("download session shut down");
    }
}

/// Resolves the directory all session files live under.
///
/// Probes the primary root first (when configured) and falls back to the
/// fallback root: a root qualifies when it can be created and written to.
/// The chosen root is joined with the fixed `downloads` directory name,
/// created, and canonicalized so differently-spelled paths to one directory
/// share one session.
///
/// Resolution is deterministic: identical filesystem state yields the same
/// answer on every call.
///
/// # Errors
///
/// Returns [`RegistryError::StorageUnavailable`] when no candidate root is
/// writable.
#[instrument]
pub fn resolve_content_root(
    primary: Option<&Path>,
    fallback: &Path,
) -> Result<PathBuf, RegistryError> {
    let mut tried = Vec::new();

    for root in primary.into_iter().chain(std::iter::once(fallback)) {
        match probe_writable_content_dir(root) {
            Ok(content_root) => {
                debug!(root = %root.display(), content_root = %content_root.display(), "storage root resolved");
                return Ok(content_root);
            }
            Err(e) => {
                debug!(root = %root.display(), error = %e, "storage root not writable");
                tried.push(root.to_path_buf());
            }
        }
    }

    Err(RegistryError::StorageUnavailable { tried })
}

/// Creates the content directory under `root` and verifies it is writable.
fn probe_writable_content_dir(root: &Path) -> std::io::Result<PathBuf> {
    let content_root = root.join(DOWNLOAD_CONTENT_DIR);
    std::fs::create_dir_all(&content_root)?;

    let probe = content_root.join(WRITE_PROBE_FILE);
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)?;

    content_root.canonicalize()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_primary_root() {
        let primary = tempfile::tempdir().unwrap();
        let fallback = tempfile::tempdir().unwrap();

        let resolved = resolve_content_root(Some(primary.path()), fallback.path()).unwrap();

        let expected = primary
            .path()
            .join(DOWNLOAD_CONTENT_DIR)
            .canonicalize()
            .unwrap();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_resolve_falls_back_without_primary() {
        let fallback = tempfile::tempdir().unwrap();

        let resolved = resolve_content_root(None, fallback.path()).unwrap();

        let expected = fallback
            .path()
            .join(DOWNLOAD_CONTENT_DIR)
            .canonicalize()
            .unwrap();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_resolve_falls_back_when_primary_unwritable() {
        let fallback = tempfile::tempdir().unwrap();
        // A file, not a directory: create_dir_all under it must fail.
        let blocked = fallback.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();

        let resolved = resolve_content_root(Some(&blocked), fallback.path()).unwrap();

        let expected = fallback
            .path()
            .join(DOWNLOAD_CONTENT_DIR)
            .canonicalize()
            .unwrap();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let fallback = tempfile::tempdir().unwrap();

        let first = resolve_content_root(None, fallback.path()).unwrap();
        let second = resolve_content_root(None, fallback.path()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_errors_when_nothing_writable() {
        let dir = tempfile::tempdir().unwrap();
        let blocked_a = dir.path().join("a");
        let blocked_b = dir.path().join("b");
        std::fs::write(&blocked_a, b"x").unwrap();
        std::fs::write(&blocked_b, b"x").unwrap();

        let result = resolve_content_root(Some(&blocked_a), &blocked_b);

        match result {
            Err(RegistryError::StorageUnavailable { tried }) => {
                assert_eq!(tried, vec![blocked_a, blocked_b]);
            }
            other => panic!("expected StorageUnavailable, got {other:?}"),
        }
    }
}
