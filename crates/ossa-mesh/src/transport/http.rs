//! HTTP transport
//!
//! POSTs the JSON envelope to `{endpoint}/messages`. Trace context travels in
//! the W3C `traceparent` / `tracestate` headers as well as in the body.
//!
//! | Status | Result | Retried |
//! |--------|--------|---------|
//! | 2xx | delivered | - |
//! | 429 | `RATE_LIMITED`, honours `Retry-After` | Yes |
//! | other 4xx / 5xx | transport error carrying the status | Yes |
//! | connect / timeout | transport error | Yes |

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::Transport;
use crate::error::{MeshError, MeshResult};
use crate::message::{MessageEnvelope, TransportKind};

/// Path appended to a card's HTTP endpoint
pub const MESSAGES_PATH: &str = "/messages";

/// Default per-attempt timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Transport`] over HTTP using `reqwest`
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    timeout: Duration,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport with the default per-attempt timeout
    pub fn new() -> MeshResult<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a transport whose attempts give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> MeshResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(format!("ossa-mesh/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MeshError::transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, timeout })
    }

    /// Wrap an existing `reqwest` client
    pub fn with_http_client(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn messages_url(endpoint: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), MESSAGES_PATH)
    }
}

/// Parse a `Retry-After` header given in delta-seconds
fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, endpoint: &str, envelope: &MessageEnvelope) -> MeshResult<()> {
        let url = Self::messages_url(endpoint);
        debug!(url = %url, message_id = %envelope.id, "Posting envelope");

        let mut request = self.http.post(&url).timeout(self.timeout).json(envelope);
        if let Some(trace) = &envelope.trace {
            request = request.header("traceparent", &trace.traceparent);
            if let Some(state) = &trace.tracestate {
                request = request.header("tracestate", state);
            }
        }

        let response = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() { "timed out" } else { "failed" };
            MeshError::transport(format!("POST {} {}: {}", url, reason, e))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
            retry_after_secs(response.headers())
        } else {
            None
        };
        let body = response.text().await.unwrap_or_default();
        Err(MeshError::Transport {
            message: format!("POST {} returned {}: {}", url, status, body),
            status: Some(status.as_u16()),
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_messages_url() {
        assert_eq!(
            HttpTransport::messages_url("http://localhost:8080"),
            "http://localhost:8080/messages"
        );
        assert_eq!(
            HttpTransport::messages_url("http://localhost:8080/agents/b/"),
            "http://localhost:8080/agents/b/messages"
        );
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_secs(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_secs(&headers), Some(7));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after_secs(&headers), None);
    }
}
