use futures::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::parser::{parse_feed, ParsedFeed};
use super::FeedError;
use crate::util::validate_feed_url;

/// Default bound on a whole retrieval (connect, headers and body).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default cap on a feed body.
pub const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_REDIRECTS: usize = 5;

/// Errors that can occur while retrieving a feed document.
///
/// All of these are fatal to a single ingestion attempt. None are retried
/// here; the next refresh cycle is the retry.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, redirect policy, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Retrieval exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// The caller's cancellation token fired mid-retrieval
    #[error("Request cancelled")]
    Cancelled,
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// HTTP retrieval of feed documents with a timeout and a body-size cap.
///
/// Cloning is cheap; the underlying `reqwest::Client` shares its pool.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_size: usize,
}

impl FeedFetcher {
    /// Builds a fetcher with its own HTTP client.
    ///
    /// Every redirect target must pass [`validate_feed_url`] with
    /// `allow_private_hosts`, so a public feed cannot bounce the request
    /// onto loopback or a private network.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Network`] if the TLS backend cannot be initialized.
    pub fn new(
        timeout: Duration,
        max_size: usize,
        user_agent: &str,
        allow_private_hosts: bool,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(redirect_policy(allow_private_hosts))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, timeout, max_size))
    }

    /// Wraps an existing client, e.g. one shared with other components. Its
    /// redirect policy is used as is, without redirect target validation.
    pub fn with_client(client: reqwest::Client, timeout: Duration, max_size: usize) -> Self {
        Self {
            client,
            timeout,
            max_size,
        }
    }

    /// Retrieves and decodes the feed at `url`.
    ///
    /// The whole retrieval races both the timeout and `cancel`; whichever
    /// fires first aborts the request. A non-2xx status fails before the
    /// body is read.
    ///
    /// # Errors
    ///
    /// - [`FeedError::Fetch`] for transport failures, bad status, timeout,
    ///   cancellation, or an oversize/truncated body
    /// - [`FeedError::Parse`] when the body is not a usable RSS document
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<ParsedFeed, FeedError> {
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled.into()),
            res = tokio::time::timeout(self.timeout, self.download(url)) => {
                res.map_err(|_| FetchError::Timeout)??
            }
        };

        let feed = parse_feed(&bytes)?;

        if feed.skipped > 0 {
            tracing::warn!(
                feed = %url,
                skipped = feed.skipped,
                kept = feed.items.len(),
                "Items with unparseable publication dates skipped"
            );
        }

        Ok(feed)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, self.max_size).await
    }
}

fn redirect_policy(allow_private_hosts: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("Too many redirects (max {MAX_REDIRECTS})"));
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }
        if let Err(e) = validate_feed_url(url.as_str(), allow_private_hosts) {
            tracing::warn!(to = %url, error = %e, "Refusing feed redirect");
            return attempt.error(e);
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following feed redirect"
        );
        attempt.follow()
    })
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
