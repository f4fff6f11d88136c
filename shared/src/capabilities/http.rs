use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const MAX_URL_LENGTH: usize = 2048;

/// How a batch leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Ordinary request with a result.
    Request,
    /// One-way, best-effort send used while the host is unloading. The
    /// response carries no information.
    Beacon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub kind: TransportKind,
    pub timeout: Duration,
}

/// Collector response, as reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub http_status_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    /// Server retry hint in seconds, as received.
    #[serde(default)]
    pub retry_after: Option<String>,
}

impl BatchResponse {
    pub const TIMEOUT: &'static str = "timeout";

    pub fn ok() -> Self {
        Self {
            success: true,
            http_status_code: Some(200),
            ..Self::default()
        }
    }

    pub fn status(code: i32) -> Self {
        Self {
            success: (200..300).contains(&code),
            http_status_code: Some(code),
            ..Self::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            error: Some(Self::TIMEOUT.to_string()),
            ..Self::default()
        }
    }

    /// Transport-level failure with no HTTP status (connection refused, DNS).
    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            http_status_code: Some(0),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: impl Into<String>) -> Self {
        self.retry_after = Some(retry_after.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(Self::TIMEOUT)
    }

    /// The server retry hint, if it parses to a positive number of seconds.
    pub fn retry_after_hint(&self) -> Option<Duration> {
        let raw = self.retry_after.as_deref()?.trim();
        let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse::<u64>() {
            Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }
}

/// What the sender should do with a batch after a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Retry { retry_after: Option<Duration> },
    PayloadTooLarge,
    /// The server made a final decision; retrying will not help.
    Terminal,
}

pub fn classify(response: &BatchResponse, online: bool) -> ResponseClass {
    if response.success {
        return ResponseClass::Success;
    }
    let status = response.http_status_code;
    let retryable = matches!(status, Some(code) if code >= 500 || code == 429)
        || (matches!(status, Some(code) if code <= 0) && !online)
        || response.is_timeout();
    if retryable {
        return ResponseClass::Retry {
            retry_after: response.retry_after_hint(),
        };
    }
    if status == Some(413) {
        return ResponseClass::PayloadTooLarge;
    }
    ResponseClass::Terminal
}

/// Network collaborator for one stream endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs the payload array. Failures are reported inside the response,
    /// never as a panic or an error value.
    async fn send(&self, payloads: &[Value], options: &RequestOptions) -> BatchResponse;

    fn is_online(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        if url.len() > MAX_URL_LENGTH {
            return Err(TransportError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: format!("URL exceeds {MAX_URL_LENGTH} characters"),
            });
        }

        let parsed = Url::parse(&url).map_err(|e| TransportError::InvalidUrl {
            url: Self::truncate_url(&url),
            reason: e.to_string(),
        })?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        if parsed.host_str().is_none() {
            return Err(TransportError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "missing host".to_string(),
            });
        }

        Ok(Self {
            url: parsed.to_string(),
        })
    }

    /// Joins `route` onto this base, keeping any path prefix of the base.
    pub fn join(&self, route: &str) -> Result<Self, TransportError> {
        let base = self.url.trim_end_matches('/');
        let route = route.trim_start_matches('/');
        Self::new(format!("{base}/{route}"))
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    fn truncate_url(url: &str) -> String {
        if url.len() > 100 {
            format!("{}...", url.chars().take(100).collect::<String>())
        } else {
            url.to_string()
        }
    }
}

#[cfg(feature = "http")]
pub use self::reqwest_transport::HttpTransport;

#[cfg(feature = "http")]
mod reqwest_transport {
    use super::*;
    use reqwest::header::RETRY_AFTER;
    use reqwest::Client;
    use tracing::{debug, warn};

    /// Transport that POSTs JSON arrays with reqwest.
    #[derive(Clone)]
    pub struct HttpTransport {
        client: Client,
        endpoint: ValidatedUrl,
    }

    impl HttpTransport {
        pub fn new(endpoint: ValidatedUrl) -> Result<Self, TransportError> {
            let client = Client::builder()
                .build()
                .map_err(|e| TransportError::Client(e.to_string()))?;
            Ok(Self { client, endpoint })
        }

        pub fn endpoint(&self) -> &ValidatedUrl {
            &self.endpoint
        }

        async fn post(&self, payloads: &[Value], timeout: Duration) -> BatchResponse {
            let result = self
                .client
                .post(self.endpoint.as_str())
                .timeout(timeout)
                .json(payloads)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = i32::from(response.status().as_u16());
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    debug!(status, endpoint = %self.endpoint.as_str(), "collector responded");
                    let mut parsed = BatchResponse::status(status);
                    parsed.retry_after = retry_after;
                    parsed
                }
                Err(e) if e.is_timeout() => BatchResponse::timeout(),
                Err(e) => {
                    warn!(error = %e, endpoint = %self.endpoint.as_str(), "request failed");
                    BatchResponse::network_error(e.to_string())
                }
            }
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn send(&self, payloads: &[Value], options: &RequestOptions) -> BatchResponse {
            match options.kind {
                TransportKind::Request => self.post(payloads, options.timeout).await,
                TransportKind::Beacon => {
                    let this = self.clone();
                    let body = payloads.to_vec();
                    let timeout = options.timeout;
                    tokio::spawn(async move {
                        let _ = this.post(&body, timeout).await;
                    });
                    BatchResponse::default()
                }
            }
        }
    }
}
