//! Shared storage handle for the persistent index and the content cache.
//!
//! Both the task index and the cache span bookkeeping live in one `SQLite`
//! file. Opening that file twice from independent handles risks WAL
//! conflicts, so the session registry constructs exactly one [`StorageHandle`]
//! and hands clones of it (they share the pool) to both consumers.
//!
//! # Example
//!
//! ```no_run
//! use mediadl_core::StorageHandle;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StorageHandle::open(Path::new("session.db")).await?;
//! // Hand `store` to the index and the cache...
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
/// Connections will wait this long before returning SQLITE_BUSY.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Storage-level errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to connect to the backing database file.
    #[error("failed to open storage: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run schema migrations.
    #[error("failed to run storage migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the session's on-disk database.
///
/// Wraps a `SQLite` connection pool with WAL mode and automatic migration
/// execution. Cloning is cheap and clones share the same pool, which is what
/// keeps the index and the cache on a single writer.
#[derive(Debug, Clone)]
pub struct StorageHandle {
    pool: SqlitePool,
}

impl StorageHandle {
    /// Opens (or creates) the session database at the given path.
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for concurrent reads
    /// 3. Run any pending migrations
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the connection fails,
    /// or [`StoreError::Migration`] if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        // Enable WAL mode for concurrent reads
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        // Set busy timeout to avoid immediate lock errors
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens an in-memory database for testing.
    ///
    /// The database exists only for the lifetime of the connection.
    /// WAL mode is not enabled since it provides no benefit in memory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the connection fails,
    /// or [`StoreError::Migration`] if migrations fail.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    ///
    /// Use this for executing queries with sqlx.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, StoreError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.to_lowercase() == "wal")
    }

    /// Returns true once [`close`](Self::close) has run on any clone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Gracefully closes all connections in the pool.
    ///
    /// Called from the registry's shutdown path. After this, every clone of
    /// the handle is unusable.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
