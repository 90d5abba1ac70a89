use crate::backoff::Retryable;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::timeout;

/// HTTP client for snapshot downloads and registry lookups.
///
/// Performs single attempts only; callers wrap it in a `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout_duration: Duration,
    max_content_size: usize,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout_secs: u64) -> Result<Self, FetchError> {
        Self::with_content_limit(user_agent, timeout_secs, crate::config::Config::MAX_SNAPSHOT_BYTES)
    }

    pub fn with_content_limit(
        user_agent: &str,
        timeout_secs: u64,
        max_content_size: usize,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(crate::config::Config::CONNECT_TIMEOUT_SECS))
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            timeout_duration: Duration::from_secs(timeout_secs),
            max_content_size,
        })
    }

    /// Fetch a URL once and return the raw body.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.send(url, "*/*").await?;

        if let Some(length) = response.content_length() {
            if length as usize > self.max_content_size {
                return Err(FetchError::ContentTooLarge(length as usize, self.max_content_size));
            }
        }

        let body = timeout(self.timeout_duration, response.bytes())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| FetchError::BodyError(e.to_string()))?;

        if body.len() > self.max_content_size {
            return Err(FetchError::ContentTooLarge(body.len(), self.max_content_size));
        }

        Ok(body.to_vec())
    }

    /// Fetch a URL once and decode a JSON body.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.send(url, "application/rdap+json, application/json").await?;
        timeout(self.timeout_duration, response.json::<T>())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| FetchError::BodyError(e.to_string()))
    }

    async fn send(&self, url: &str, accept: &str) -> Result<reqwest::Response, FetchError> {
        let response = timeout(
            self.timeout_duration,
            self.client.get(url).header("Accept", accept).send(),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(Self::classify_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }

    fn classify_error(error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            return FetchError::Timeout;
        }
        if error.is_builder() {
            return FetchError::InvalidUrl(error.to_string());
        }

        let error_msg = error.to_string().to_lowercase();
        if error_msg.contains("connection refused") {
            return FetchError::ConnectionRefused;
        }
        if error_msg.contains("dns") || error_msg.contains("name resolution") {
            return FetchError::DnsError;
        }
        if error_msg.contains("certificate") || error_msg.contains("tls") {
            return FetchError::SslError;
        }

        FetchError::NetworkError(error.to_string())
    }
}

/// Failure to obtain snapshot bytes or a lookup response.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection refused - server not accepting connections")]
    ConnectionRefused,

    #[error("DNS resolution failed")]
    DnsError,

    #[error("SSL/TLS error - certificate or encryption issue")]
    SslError,

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to read response body: {0}")]
    BodyError(String),

    #[error("Content too large: {0} bytes (max: {1} bytes)")]
    ContentTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot list: {0}")]
    Manifest(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl FetchError {
    /// The data is genuinely missing or unusable; retrying later will not help.
    pub fn is_permanent(&self) -> bool {
        match self {
            FetchError::NotFound(_) | FetchError::InvalidUrl(_) | FetchError::ContentTooLarge(_, _) => true,
            FetchError::HttpStatus(code) => (400..500).contains(code) && *code != 408 && *code != 429,
            FetchError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl Retryable for FetchError {
    /// Worth another attempt within the same run.
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::NetworkError(_) | FetchError::ConnectionRefused => true,
            FetchError::HttpStatus(code) => *code >= 500 || *code == 408 || *code == 429,
            FetchError::BodyError(_) => true,
            FetchError::Io(_) => !self.is_permanent(),
            // DNS, TLS and client-side problems will not fix themselves in seconds.
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_invalid_url() {
        let client = HttpClient::new("TestBot/1.0", 5).unwrap();
        let result = client.fetch_bytes("not-a-url").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_http_client_creation() {
        assert!(HttpClient::new("TestBot/1.0", 30).is_ok());
    }

    #[test]
    fn test_permanent_vs_transient() {
        assert!(FetchError::NotFound("x".into()).is_permanent());
        assert!(FetchError::HttpStatus(403).is_permanent());
        assert!(!FetchError::HttpStatus(429).is_permanent());
        assert!(!FetchError::HttpStatus(503).is_permanent());
        assert!(!FetchError::Timeout.is_permanent());
        assert!(!FetchError::DnsError.is_permanent());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(FetchError::Io(missing).is_permanent());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::HttpStatus(503).is_retryable());
        assert!(!FetchError::HttpStatus(404).is_retryable());
        assert!(!FetchError::NotFound("x".into()).is_retryable());
        assert!(!FetchError::SslError.is_retryable());
    }
}
