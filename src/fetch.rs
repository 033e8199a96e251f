//! Remote document fetcher
//!
//! Retrieves the source HTML page over HTTP. Each call performs exactly one
//! request; retries and fallback are the cache's job, not the fetcher's.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

/// User-Agent sent with every request so the origin can identify us
pub const USER_AGENT: &str = "API Cacher";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while fetching the remote document
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Transport failure: DNS, connection, TLS, timeout or body decoding
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("Failed to fetch {url}: HTTP {status}")]
    Status {
        /// URL that was requested
        url: String,
        /// Status code returned by the server
        status: u16,
    },
}

/// Source of the document body
///
/// Implemented by [`HttpFetcher`] in production and by fakes in tests.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Performs a single fetch of `url` and returns the response body.
    async fn fetch(&self, url: &str) -> Result<String, NetworkError>;
}

/// Fetches documents with a reqwest [`Client`]
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher with the default timeout
    pub fn new() -> Result<Self, NetworkError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Creates a fetcher whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, NetworkError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_message_names_url_and_code() {
        let err = NetworkError::Status {
            url: "http://roster.example/".to_string(),
            status: 503,
        };
        let msg = err.to_string();
        assert!(msg.contains("http://roster.example/"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_http_fetcher_builds_with_default_timeout() {
        assert!(HttpFetcher::new().is_ok());
        assert!(HttpFetcher::with_timeout(Duration::from_millis(250)).is_ok());
    }

    #[tokio::test]
    async fn test_fetch_invalid_url_is_transport_error() {
        let fetcher = HttpFetcher::new().expect("client should build");
        let result = fetcher.fetch("not a url").await;
        assert!(matches!(result, Err(NetworkError::Transport(_))));
    }
}
