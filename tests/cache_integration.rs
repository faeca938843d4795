//! Integration tests for the content cache.
//!
//! Unit-level span arithmetic lives in the module tests; these cover
//! persistence across reopen and the cache/index storage-sharing invariant.

use mediadl_core::{ContentCache, EvictionPolicy, PersistentIndex, StorageHandle};
use tempfile::TempDir;

const CLIP: &str = "https://example.com/clip.mp4";

/// Helper: file-backed storage plus a cache dir, both inside one temp root.
async fn setup() -> (StorageHandle, ContentCache, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = StorageHandle::open(&temp_dir.path().join("index.db"))
        .await
        .expect("Failed to open storage");
    let cache = ContentCache::open(
        &temp_dir.path().join("content"),
        EvictionPolicy::None,
        store.clone(),
    )
    .await
    .expect("Failed to open cache");
    (store, cache, temp_dir)
}

#[tokio::test]
async fn test_spans_survive_reopen() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("index.db");
    let content_dir = temp_dir.path().join("content");

    {
        let store = StorageHandle::open(&db_path).await.expect("open");
        let cache = ContentCache::open(&content_dir, EvictionPolicy::None, store.clone())
            .await
            .expect("open cache");
        cache.write_span(CLIP, 0, &[7u8; 256]).await.expect("write");
        cache
            .write_span(CLIP, 256, &[8u8; 256])
            .await
            .expect("write");
        store.close().await;
    }

    let store = StorageHandle::open(&db_path).await.expect("reopen");
    let cache = ContentCache::open(&content_dir, EvictionPolicy::None, store)
        .await
        .expect("reopen cache");

    assert_eq!(cache.cached_bytes(CLIP).await.expect("cached"), 512);
    let bytes = cache
        .read_span(CLIP, 300, 100)
        .await
        .expect("read")
        .expect("covered");
    assert_eq!(bytes, vec![8u8; 100]);
}

#[tokio::test]
async fn test_reopen_with_same_dir_is_side_effect_free() {
    let (store, cache, temp_dir) = setup().await;
    cache.write_span(CLIP, 0, &[1u8; 64]).await.expect("write");

    // Opening the same directory again must not disturb existing spans.
    let again = ContentCache::open(
        &temp_dir.path().join("content"),
        EvictionPolicy::None,
        store,
    )
    .await
    .expect("reopen");

    assert_eq!(again.cached_bytes(CLIP).await.expect("cached"), 64);
    assert_eq!(again.total_bytes().await.expect("total"), 64);
}

#[tokio::test]
async fn test_cache_and_index_share_one_database() {
    let (store, cache, _temp_dir) = setup().await;
    let index = PersistentIndex::new(store.clone());

    index.upsert_queued(CLIP, 0).await.expect("upsert");
    cache.write_span(CLIP, 0, &[9u8; 32]).await.expect("write");

    // Both tables answer through the one handle.
    let tasks: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
        .fetch_one(store.pool())
        .await
        .expect("tasks query");
    let spans: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_spans")
        .fetch_one(store.pool())
        .await
        .expect("spans query");
    assert_eq!(tasks.0, 1);
    assert_eq!(spans.0, 1);
}

#[tokio::test]
async fn test_overlapping_rewrite_replaces_span() {
    let (_store, cache, _temp_dir) = setup().await;

    cache.write_span(CLIP, 0, &[1u8; 128]).await.expect("write");
    // Same offset, new content: the record and file are replaced.
    cache.write_span(CLIP, 0, &[2u8; 64]).await.expect("rewrite");

    let spans = cache.spans(CLIP).await.expect("spans");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].length, 64);

    let bytes = cache
        .read_span(CLIP, 0, 64)
        .await
        .expect("read")
        .expect("covered");
    assert_eq!(bytes, vec![2u8; 64]);
}

#[tokio::test]
async fn test_distinct_content_ids_do_not_collide() {
    let (_store, cache, _temp_dir) = setup().await;

    cache
        .write_span("https://example.com/a.mp4", 0, b"aaaa")
        .await
        .expect("write a");
    cache
        .write_span("https://example.com/b.mp4", 0, b"bbbb")
        .await
        .expect("write b");

    let a = cache
        .read_span("https://example.com/a.mp4", 0, 4)
        .await
        .expect("read")
        .expect("covered");
    let b = cache
        .read_span("https://example.com/b.mp4", 0, 4)
        .await
        .expect("read")
        .expect("covered");
    assert_eq!(a, b"aaaa");
    assert_eq!(b, b"bbbb");
}

#[tokio::test]
async fn test_lru_eviction_only_when_over_budget() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = StorageHandle::open(&temp_dir.path().join("index.db"))
        .await
        .expect("open");
    let cache = ContentCache::open(
        &temp_dir.path().join("content"),
        EvictionPolicy::LeastRecentlyUsed {
            max_total_bytes: 4096,
        },
        store,
    )
    .await
    .expect("open cache");

    cache
        .write_span("https://example.com/a.mp4", 0, &[0u8; 1024])
        .await
        .expect("write");
    cache
        .write_span("https://example.com/b.mp4", 0, &[0u8; 1024])
        .await
        .expect("write");

    // Under budget: nothing evicted.
    assert!(cache.contains("https://example.com/a.mp4").await.expect("contains"));
    assert!(cache.contains("https://example.com/b.mp4").await.expect("contains"));
    assert_eq!(cache.total_bytes().await.expect("total"), 2048);
}
