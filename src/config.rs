//! Session construction parameters.
//!
//! A [`SessionConfig`] names everything the registry needs to build a
//! session: where bytes may live, how the session identifies itself over
//! HTTP, and the tuning knobs for the cache and the task manager. All
//! defaults mirror the library constants; builder-style `with_*` methods
//! override individual values.

use std::path::PathBuf;

use crate::cache::EvictionPolicy;
use crate::manager::{DEFAULT_CONCURRENCY, DEFAULT_SPAN_BYTES, ManagerOptions, RetryPolicy};
use crate::transport::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

/// Default client identifier sent in the transport User-Agent.
pub const DEFAULT_CLIENT_ID: &str = "mediadl";

/// Everything needed to open a download session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Preferred storage root (e.g. an app-scoped external directory).
    /// When absent or not writable, `fallback_root` is used.
    pub primary_root: Option<PathBuf>,
    /// Storage root used when the primary one is unavailable.
    pub fallback_root: PathBuf,
    /// Fixed client identifier carried by every transport connection.
    pub client_id: String,
    /// Eviction policy for the content cache.
    pub eviction: EvictionPolicy,
    /// Maximum concurrent downloads.
    pub concurrency: usize,
    /// Retry policy for fetch attempts.
    pub retry_policy: RetryPolicy,
    /// Bytes buffered before each cache span write.
    pub span_bytes: usize,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl SessionConfig {
    /// Creates a config with the given fallback root and defaults otherwise.
    #[must_use]
    pub fn new(fallback_root: impl Into<PathBuf>) -> Self {
        Self {
            primary_root: None,
            fallback_root: fallback_root.into(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            eviction: EvictionPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
            span_bytes: DEFAULT_SPAN_BYTES,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
        }
    }

    /// Sets the preferred storage root.
    #[must_use]
    pub fn with_primary_root(mut self, primary_root: impl Into<PathBuf>) -> Self {
        self.primary_root = Some(primary_root.into());
        self
    }

    /// Sets the client identifier.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the cache eviction policy.
    #[must_use]
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Sets the download concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Sets the span buffer size.
    #[must_use]
    pub fn with_span_bytes(mut self, span_bytes: usize) -> Self {
        self.span_bytes = span_bytes;
        self
    }

    /// Sets the HTTP timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        self.connect_timeout_secs = connect_timeout_secs;
        self.read_timeout_secs = read_timeout_secs;
        self
    }

    /// The task manager options this config implies.
    pub(crate) fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            concurrency: self.concurrency,
            retry_policy: self.retry_policy.clone(),
            span_bytes: self.span_bytes,
        }
    }
}
