use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

use super::dates::{http_date, parse_http_date};
use crate::config::Config;

const ACCEPT_FEEDS: &str = "application/atom+xml,application/rdf+xml,application/rss+xml,\
application/x-netcdf,application/xml;q=0.9,text/xml;q=0.2,*/*;q=0.1";

const MAX_REDIRECTS: usize = 10;

/// Classified outcome of a fetch that produced no new content.
///
/// Every variant maps to exactly one podcast state transition; see
/// [`crate::reconciler`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP 304, or a 200 whose body hashes to the stored content hash.
    #[error("Not modified")]
    NotModified,
    /// HTTP 410: the publisher has retired the feed.
    #[error("Feed discontinued (HTTP 410)")]
    Discontinued,
    /// Any other 4xx response.
    #[error("Feed inaccessible: HTTP {0}")]
    Inaccessible(u16),
    /// 5xx responses and transport failures.
    #[error("Feed unavailable: {0}")]
    Unavailable(#[from] TransportError),
}

/// Why a feed could not be downloaded. Always transient from the
/// scheduler's point of view.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS, connection, TLS, redirect loop, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Server-side or otherwise unusable HTTP status
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Cache validators stored from the previous successful fetch.
#[derive(Debug, Clone, Default)]
pub struct CacheValidators {
    pub etag: String,
    pub modified: Option<DateTime<Utc>>,
    pub content_hash: String,
}

/// A feed body that is new relative to the stored validators.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub etag: String,
    pub modified: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub content: Vec<u8>,
}

/// Conditional HTTP client for feed URLs.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_size: usize,
}

impl Fetcher {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self::with_client(
            client,
            config.request_timeout(),
            config.max_feed_size,
        ))
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration, max_size: usize) -> Self {
        Self {
            client,
            timeout,
            max_size,
        }
    }

    /// Fetches `url`, honoring the stored validators.
    ///
    /// The timeout covers the whole exchange (connect, headers and body) and
    /// is reported as [`TransportError::Timeout`].
    pub async fn fetch(
        &self,
        url: &str,
        validators: &CacheValidators,
    ) -> Result<FetchResponse, FetchError> {
        let response = tokio::time::timeout(self.timeout, self.fetch_inner(url, validators))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if !validators.content_hash.is_empty() && response.content_hash == validators.content_hash {
            return Err(FetchError::NotModified);
        }

        Ok(response)
    }

    async fn fetch_inner(
        &self,
        url: &str,
        validators: &CacheValidators,
    ) -> Result<FetchResponse, FetchError> {
        let mut request = self.client.get(url).header(ACCEPT, ACCEPT_FEEDS);

        if !validators.etag.is_empty() {
            request = request.header(IF_NONE_MATCH, quote_etag(&validators.etag));
        }
        if let Some(modified) = validators.modified {
            request = request.header(IF_MODIFIED_SINCE, http_date(modified));
        }

        let response = request.send().await.map_err(TransportError::Network)?;
        let status = response.status();

        match status {
            StatusCode::NOT_MODIFIED => return Err(FetchError::NotModified),
            StatusCode::GONE => return Err(FetchError::Discontinued),
            s if s.is_client_error() => return Err(FetchError::Inaccessible(s.as_u16())),
            s if !s.is_success() => return Err(TransportError::HttpStatus(s.as_u16()).into()),
            _ => {}
        }

        let final_url = response.url().to_string();
        let headers = response.headers();
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        let content = read_limited_bytes(response, self.max_size).await?;

        Ok(FetchResponse {
            url: final_url,
            status: status.as_u16(),
            etag,
            modified,
            content_hash: make_content_hash(&content),
            content,
        })
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("Too many redirects (max {MAX_REDIRECTS})"));
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// Wraps a bare ETag in quotes; quoted and weak tags pass through.
pub fn quote_etag(etag: &str) -> String {
    if etag.starts_with('"') || etag.starts_with("W/") {
        etag.to_owned()
    } else {
        format!("\"{etag}\"")
    }
}

/// SHA-256 hex digest of `content` with surrounding whitespace removed.
///
/// An empty (or all-whitespace) body hashes to the empty string so that it
/// never matches a stored hash.
pub fn make_content_hash(content: &[u8]) -> String {
    let is_space = |b: &u8| matches!(b, b' ' | b'\t' | b'\r' | b'\n');
    let start = content.iter().position(|b| !is_space(b));
    let end = content.iter().rposition(|b| !is_space(b));

    match (start, end) {
        (Some(start), Some(end)) => format!("{:x}", Sha256::digest(&content[start..=end])),
        _ => String::new(),
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(TransportError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(TransportError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(TransportError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
