//! Factory for HTTP data sources carrying the session's client identifier.
//!
//! Every transport a session hands out identifies itself with the same
//! User-Agent, derived from the client identifier the session was configured
//! with. Single source for the UA format so all session traffic stays
//! consistent (good citizenship; RFC 9308).

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, instrument};

use super::client::Transport;
use super::error::TransportError;

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/mediadl";

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Builds the User-Agent string for a client identifier.
#[must_use]
pub(crate) fn build_user_agent(client_id: &str) -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{client_id}/{version} (+{PROJECT_UA_URL})")
}

/// Builder of HTTP connections tagged with a fixed client identifier.
///
/// The factory itself holds no sockets; each [`create`](Self::create) call
/// builds a [`Transport`] with its own connection pool. Sessions typically
/// create one transport and reuse it for all tasks.
#[derive(Debug, Clone)]
pub struct TransportFactory {
    client_id: String,
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
}

impl TransportFactory {
    /// Creates a factory with the given client identifier and default timeouts.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_timeouts(client_id, CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a factory with explicit timeout values.
    #[must_use]
    pub fn with_timeouts(
        client_id: impl Into<String>,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            connect_timeout_secs,
            read_timeout_secs,
        }
    }

    /// Returns the fixed client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the User-Agent every produced transport will send.
    #[must_use]
    pub fn user_agent(&self) -> String {
        build_user_agent(&self.client_id)
    }

    /// Builds a transport with a fresh connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Build`] if the underlying HTTP client
    /// cannot be constructed.
    #[instrument(skip(self), fields(client_id = %self.client_id))]
    pub fn create(&self) -> Result<Transport, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .read_timeout(Duration::from_secs(self.read_timeout_secs))
            .user_agent(self.user_agent())
            .build()
            .map_err(TransportError::Build)?;

        debug!(
            connect_timeout_secs = self.connect_timeout_secs,
            read_timeout_secs = self.read_timeout_secs,
            "transport created"
        );

        Ok(Transport::from_client(client))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_contains_client_id_version_and_url() {
        let factory = TransportFactory::new("player-app");
        let ua = factory.user_agent();
        assert!(
            ua.starts_with("player-app/"),
            "UA must lead with the client id: {ua}"
        );
        assert!(
            ua.contains(env!("CARGO_PKG_VERSION")),
            "UA must contain crate version: {ua}"
        );
        assert!(
            ua.contains(PROJECT_UA_URL),
            "UA must contain project URL: {ua}"
        );
    }

    #[test]
    fn test_factory_keeps_client_id_fixed() {
        let factory = TransportFactory::new("player-app");
        assert_eq!(factory.client_id(), "player-app");
        assert_eq!(factory.user_agent(), factory.user_agent());
    }

    #[test]
    fn test_create_builds_transport() {
        let factory = TransportFactory::with_timeouts("player-app", 5, 10);
        let transport = factory.create();
        assert!(transport.is_ok(), "static configuration must build");
    }
}
