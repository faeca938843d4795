//! HTTP data source with byte-range fetch support.
//!
//! A [`Transport`] wraps a configured HTTP client. Fetches start at an
//! arbitrary byte offset via `Range` headers, so interrupted downloads
//! resume from the first byte missing in the cache instead of restarting.

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, RANGE, RETRY_AFTER};
use tracing::{debug, instrument};
use url::Url;

use super::error::TransportError;

/// What a HEAD probe learned about a remote resource.
#[derive(Debug, Clone)]
pub struct RemoteResource {
    /// Total size in bytes when the server reports one.
    pub total_length: Option<u64>,
    /// Whether the server advertises byte-range support.
    pub supports_ranges: bool,
}

/// An in-flight fetch: response metadata plus the streaming body.
pub struct Fetch {
    url: String,
    status: u16,
    resumed: bool,
    content_length: Option<u64>,
    total_length: Option<u64>,
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
}

impl Fetch {
    /// The HTTP status of the response (200 or 206).
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// True when the server honored a non-zero range request (206).
    ///
    /// When false despite a requested offset, the server is replaying the
    /// resource from byte zero and the caller must write from offset zero.
    #[must_use]
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Bytes remaining in this response, when the server reports them.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Total size of the whole resource, when known.
    #[must_use]
    pub fn total_length(&self) -> Option<u64> {
        self.total_length
    }

    /// Pulls the next body chunk, `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] or [`TransportError::Network`]
    /// when the body stream fails mid-transfer.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => {
                if e.is_timeout() {
                    Err(TransportError::timeout(&self.url))
                } else {
                    Err(TransportError::network(&self.url, e))
                }
            }
        }
    }
}

impl std::fmt::Debug for Fetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetch")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("resumed", &self.resumed)
            .field("content_length", &self.content_length)
            .field("total_length", &self.total_length)
            .finish_non_exhaustive()
    }
}

/// HTTP connection for fetching remote byte ranges.
///
/// Designed to be created once per session (via the factory) and reused for
/// all tasks, taking advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
}

impl Transport {
    /// Wraps an already-configured client. Used by the factory.
    pub(crate) fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Returns a reference to the underlying HTTP client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Probes a resource with a HEAD request.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for unparseable URLs, and the
    /// usual network/status errors otherwise.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str) -> Result<RemoteResource, TransportError> {
        Url::parse(url).map_err(|_| TransportError::invalid_url(url))?;

        let response = self.client.head(url).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::timeout(url)
            } else {
                TransportError::network(url, e)
            }
        })?;
        let response = check_status(url, response)?;

        let supports_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        Ok(RemoteResource {
            total_length: response.content_length(),
            supports_ranges,
        })
    }

    /// Starts a fetch at the given byte offset.
    ///
    /// An offset of zero sends a plain GET. A non-zero offset sends a
    /// `Range: bytes=<offset>-` header; check [`Fetch::resumed`] to learn
    /// whether the server honored it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for unparseable URLs,
    /// [`TransportError::HttpStatus`] for non-success responses (with the
    /// Retry-After value captured on 429), and network/timeout errors.
    #[instrument(skip(self), fields(url = %url, offset))]
    pub async fn fetch_from(&self, url: &str, offset: u64) -> Result<Fetch, TransportError> {
        Url::parse(url).map_err(|_| TransportError::invalid_url(url))?;

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::timeout(url)
            } else {
                TransportError::network(url, e)
            }
        })?;
        let response = check_status(url, response)?;

        let status = response.status().as_u16();
        let resumed = status == 206 && offset > 0;
        let content_length = response.content_length();
        let total_length = if status == 206 {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
        } else {
            content_length
        };

        debug!(status, resumed, ?content_length, ?total_length, "fetch started");

        Ok(Fetch {
            url: url.to_string(),
            status,
            resumed,
            content_length,
            total_length,
            stream: response.bytes_stream().boxed(),
        })
    }
}

/// Maps non-success responses to [`TransportError::HttpStatus`],
/// capturing the Retry-After header value when present.
fn check_status(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string);

    Err(TransportError::http_status_with_retry_after(
        url,
        status,
        retry_after,
    ))
}

/// Extracts the total size from a `Content-Range: bytes start-end/total` value.
///
/// Returns `None` for the `*` form and for malformed values.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total_valid() {
        assert_eq!(
            parse_content_range_total("bytes 100-199/5000"),
            Some(5000)
        );
        assert_eq!(parse_content_range_total("bytes 0-0/1"), Some(1));
    }

    #[test]
    fn test_parse_content_range_total_unknown() {
        assert_eq!(parse_content_range_total("bytes 100-199/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
        assert_eq!(parse_content_range_total(""), None);
    }

    #[tokio::test]
    async fn test_fetch_from_rejects_invalid_url() {
        let factory = super::super::factory::TransportFactory::new("test");
        let transport = factory.create().unwrap();

        let result = transport.fetch_from("not a url", 0).await;
        assert!(matches!(
            result,
            Err(TransportError::InvalidUrl { url }) if url == "not a url"
        ));
    }

    #[tokio::test]
    async fn test_probe_rejects_invalid_url() {
        let factory = super::super::factory::TransportFactory::new("test");
        let transport = factory.create().unwrap();

        let result = transport.probe("::nope::").await;
        assert!(matches!(result, Err(TransportError::InvalidUrl { .. })));
    }
}
