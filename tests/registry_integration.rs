//! Integration tests for session registry construction.
//!
//! These verify the external contract of `SessionRegistry::open`: one
//! instance per root under concurrent opens, idempotent accessors, the
//! primary/fallback root resolution, and the construction failure taxonomy.

use std::sync::Arc;

use mediadl_core::{RegistryError, SessionConfig, SessionRegistry, TaskState};
use tempfile::TempDir;

/// Helper to build a config over a fresh temp root.
fn fresh_config() -> (SessionConfig, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = SessionConfig::new(temp_dir.path()).with_client_id("test-suite");
    (config, temp_dir)
}

// ==================== Singleton Properties ====================

#[tokio::test]
async fn test_concurrent_opens_yield_one_instance() {
    let (config, _temp_dir) = fresh_config();

    let (a, b, c) = tokio::join!(
        SessionRegistry::open(config.clone()),
        SessionRegistry::open(config.clone()),
        SessionRegistry::open(config.clone()),
    );

    let a = a.expect("first open");
    let b = b.expect("second open");
    let c = c.expect("third open");

    assert!(Arc::ptr_eq(&a, &b), "all openers must share one instance");
    assert!(Arc::ptr_eq(&b, &c), "all openers must share one instance");
}

#[tokio::test]
async fn test_sequential_opens_return_same_instance() {
    let (config, _temp_dir) = fresh_config();

    let first = SessionRegistry::open(config.clone()).await.expect("open");
    let second = SessionRegistry::open(config).await.expect("reopen");

    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_distinct_roots_get_distinct_instances() {
    let (config_a, _temp_a) = fresh_config();
    let (config_b, _temp_b) = fresh_config();

    let a = SessionRegistry::open(config_a).await.expect("open a");
    let b = SessionRegistry::open(config_b).await.expect("open b");

    assert!(!Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn test_accessors_are_idempotent() {
    let (config, _temp_dir) = fresh_config();
    let session = SessionRegistry::open(config).await.expect("open");

    assert!(Arc::ptr_eq(&session.cache(), &session.cache()));
    assert!(Arc::ptr_eq(&session.task_manager(), &session.task_manager()));
    assert_eq!(session.content_root(), session.content_root());
    assert_eq!(
        session.transport_factory().client_id(),
        session.transport_factory().client_id()
    );
}

#[tokio::test]
async fn test_dropped_session_can_be_reopened() {
    let (config, _temp_dir) = fresh_config();

    let first = SessionRegistry::open(config.clone()).await.expect("open");
    let root = first.content_root().to_path_buf();
    first.shutdown().await;
    drop(first);

    let second = SessionRegistry::open(config).await.expect("reopen");
    assert_eq!(second.content_root(), root);

    // The reopened session is live: its index answers queries.
    let queued = second
        .index()
        .count_by_state(TaskState::Queued)
        .await
        .expect("index usable after reopen");
    assert_eq!(queued, 0);
}

// ==================== Root Resolution ====================

#[tokio::test]
async fn test_content_root_is_downloads_under_primary() {
    let primary = TempDir::new().expect("temp");
    let fallback = TempDir::new().expect("temp");
    let config = SessionConfig::new(fallback.path()).with_primary_root(primary.path());

    let session = SessionRegistry::open(config).await.expect("open");

    let expected = primary
        .path()
        .join("downloads")
        .canonicalize()
        .expect("canonicalize");
    assert_eq!(session.content_root(), expected);
    assert!(expected.join("index.db").exists(), "index storage created");
}

#[tokio::test]
async fn test_unwritable_primary_falls_back() {
    let fallback = TempDir::new().expect("temp");
    // A plain file cannot host a downloads directory.
    let blocked = fallback.path().join("blocked");
    std::fs::write(&blocked, b"x").expect("write blocker");

    let config = SessionConfig::new(fallback.path()).with_primary_root(&blocked);
    let session = SessionRegistry::open(config).await.expect("open");

    let expected = fallback
        .path()
        .join("downloads")
        .canonicalize()
        .expect("canonicalize");
    assert_eq!(session.content_root(), expected);
}

#[tokio::test]
async fn test_no_writable_root_is_storage_unavailable() {
    let dir = TempDir::new().expect("temp");
    let blocked_a = dir.path().join("a");
    let blocked_b = dir.path().join("b");
    std::fs::write(&blocked_a, b"x").expect("write");
    std::fs::write(&blocked_b, b"x").expect("write");

    let config = SessionConfig::new(&blocked_b).with_primary_root(&blocked_a);
    let result = SessionRegistry::open(config).await;

    assert!(
        matches!(result, Err(RegistryError::StorageUnavailable { .. })),
        "expected StorageUnavailable, got {result:?}"
    );
}

// ==================== Failure Taxonomy ====================

#[tokio::test]
async fn test_garbage_index_file_is_index_corrupt() {
    let temp_dir = TempDir::new().expect("temp");
    let content_root = temp_dir.path().join("downloads");
    std::fs::create_dir_all(&content_root).expect("mkdir");
    std::fs::write(content_root.join("index.db"), b"this is not a database").expect("write");

    let config = SessionConfig::new(temp_dir.path());
    let result = SessionRegistry::open(config).await;

    assert!(
        matches!(result, Err(RegistryError::IndexCorrupt { .. })),
        "expected IndexCorrupt, got {result:?}"
    );
}

// ==================== Wiring ====================

#[tokio::test]
async fn test_index_and_cache_share_one_storage_handle() {
    let (config, _temp_dir) = fresh_config();
    let session = SessionRegistry::open(config).await.expect("open");

    // A span written through the cache is visible through the registry's
    // storage handle, proving both sit on the same database.
    session
        .cache()
        .write_span("https://example.com/clip.mp4", 0, b"payload")
        .await
        .expect("write span");

    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_spans")
        .fetch_one(session.storage().pool())
        .await
        .expect("query spans through shared handle");
    assert_eq!(row.0, 1);

    assert!(
        session
            .storage()
            .is_wal_enabled()
            .await
            .expect("wal check"),
        "shared handle runs in WAL mode"
    );
}

#[tokio::test]
async fn test_task_manager_is_usable_immediately() {
    let (config, _temp_dir) = fresh_config();
    let session = SessionRegistry::open(config).await.expect("open");

    // Touching only the task manager still exercises a fully-built index
    // and cache underneath.
    let manager = session.task_manager();
    manager
        .enqueue("https://example.com/clip.mp4", 0)
        .await
        .expect("enqueue through freshly-opened session");

    let record = manager
        .status("https://example.com/clip.mp4")
        .await
        .expect("status")
        .expect("record exists");
    assert_eq!(record.state(), TaskState::Queued);

    // The tracker was primed/subscribed before open returned.
    assert!(
        session
            .tracker()
            .progress("https://example.com/clip.mp4")
            .is_some()
            || session.tracker().counts().queued <= 1,
        "tracker is wired to the manager"
    );
}

#[tokio::test]
async fn test_crash_recovery_requeues_stale_downloading_tasks() {
    let (config, _temp_dir) = fresh_config();

    {
        let session = SessionRegistry::open(config.clone()).await.expect("open");
        session
            .task_manager()
            .enqueue("https://example.com/clip.mp4", 0)
            .await
            .expect("enqueue");
        // Simulate a crash mid-download: claim flips the record to
        // downloading and the process "dies" without finishing.
        let claimed = session
            .index()
            .claim_next()
            .await
            .expect("claim")
            .expect("record");
        assert_eq!(claimed.state(), TaskState::Downloading);
        session.shutdown().await;
    }

    let session = SessionRegistry::open(config).await.expect("reopen");
    let record = session
        .index()
        .get("https://example.com/clip.mp4")
        .await
        .expect("get")
        .expect("record survived restart");
    assert_eq!(
        record.state(),
        TaskState::Queued,
        "stale downloading records must be requeued at open"
    );
}
