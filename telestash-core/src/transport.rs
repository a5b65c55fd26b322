//! Delivery of queued requests to the collection endpoint
//!
//! [`Transport`] is the seam the dispatcher sends through. [`HttpTransport`]
//! POSTs the request as a form body to `<server.url>/i` and maps the
//! response through a [`FailureClassifier`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Why a delivery did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Try again later; the request stays at the head of the queue
    #[error("delivery failed, will retry (status {status:?}): {message}")]
    Retryable {
        status: Option<u16>,
        message: String,
    },

    /// The server will never accept this request; drop it
    #[error("request rejected (status {status:?}): {message}")]
    Fatal {
        status: Option<u16>,
        message: String,
    },
}

impl DeliveryError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Retryable { status, .. } | DeliveryError::Fatal { status, .. } => {
                *status
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DeliveryError::Retryable { message, .. } | DeliveryError::Fatal { message, .. } => {
                message
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, DeliveryError::Fatal { .. })
    }
}

/// Sends one request at a time
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `request` with `headers`
    async fn send(
        &self,
        request: &str,
        headers: &BTreeMap<String, String>,
    ) -> std::result::Result<(), DeliveryError>;
}

/// How a server response is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Delivered,
    Retry,
    Reject,
}

/// Maps `(status, body)` to a [`Verdict`]
pub type FailureClassifier = Arc<dyn Fn(u16, &str) -> Verdict + Send + Sync>;

/// Default response classification.
///
/// A 2xx counts as delivered only when the body is empty or reports
/// `Success`. A 4xx means the server will never accept this request, so it
/// is rejected, except 408 and 429 which ask the client to come back later.
/// Everything else is retried.
pub fn default_classifier(status: u16, body: &str) -> Verdict {
    match status {
        200..=299 if body.trim().is_empty() || body.contains("Success") => Verdict::Delivered,
        408 | 429 => Verdict::Retry,
        400..=499 => Verdict::Reject,
        _ => Verdict::Retry,
    }
}

/// HTTP transport over `reqwest`
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    classifier: FailureClassifier,
}

impl HttpTransport {
    /// Create a transport for the configured server
    pub fn new(config: &ServerConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("server.url is required".to_string()))?
            .trim_end_matches('/');

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/i", base_url),
            classifier: Arc::new(default_classifier),
        })
    }

    /// Replace the response classifier
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Full URL requests are POSTed to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Convert string headers, skipping any that are not valid HTTP
fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid header"),
        }
    }
    map
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &str,
        headers: &BTreeMap<String, String>,
    ) -> std::result::Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(to_header_map(headers))
            .body(request.to_string())
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable {
                status: None,
                message: format!("HTTP request failed: {}", e),
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        match (self.classifier)(status, &body) {
            Verdict::Delivered => Ok(()),
            Verdict::Retry => Err(DeliveryError::Retryable {
                status: Some(status),
                message: body,
            }),
            Verdict::Reject => Err(DeliveryError::Fatal {
                status: Some(status),
                message: body,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classifier() {
        assert_eq!(default_classifier(200, ""), Verdict::Delivered);
        assert_eq!(default_classifier(200, "{\"result\":\"Success\"}"), Verdict::Delivered);
        assert_eq!(default_classifier(200, "{\"result\":\"nope\"}"), Verdict::Retry);
        assert_eq!(default_classifier(302, ""), Verdict::Retry);
        assert_eq!(default_classifier(400, "bad"), Verdict::Reject);
        assert_eq!(default_classifier(404, ""), Verdict::Reject);
        assert_eq!(default_classifier(503, ""), Verdict::Retry);
    }

    #[test]
    fn test_unprocessable_client_errors_are_rejected() {
        for status in [401, 403, 413, 422] {
            assert_eq!(default_classifier(status, "bad"), Verdict::Reject, "{status}");
        }
        assert_eq!(default_classifier(408, ""), Verdict::Retry);
        assert_eq!(default_classifier(429, ""), Verdict::Retry);
    }

    #[test]
    fn test_transport_requires_valid_config() {
        assert!(HttpTransport::new(&ServerConfig::default()).is_err());
    }

    #[test]
    fn test_transport_endpoint() {
        let config = ServerConfig {
            url: Some("https://telemetry.example.com/".to_string()),
            app_key: Some("key".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.endpoint(), "https://telemetry.example.com/i");
    }

    #[test]
    fn test_custom_classifier_replaces_default() {
        let config = ServerConfig {
            url: Some("http://localhost".to_string()),
            app_key: Some("key".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config)
            .unwrap()
            .with_classifier(Arc::new(|status: u16, _body: &str| {
                if status == 200 {
                    Verdict::Delivered
                } else {
                    Verdict::Reject
                }
            }));
        assert_eq!((transport.classifier)(200, "anything"), Verdict::Delivered);
        assert_eq!((transport.classifier)(503, ""), Verdict::Reject);
    }

    #[test]
    fn test_invalid_headers_skipped() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Ok".to_string(), "yes".to_string());
        headers.insert("bad header".to_string(), "v".to_string());
        headers.insert("X-Bad-Value".to_string(), "line\nbreak".to_string());

        let map = to_header_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("x-ok").unwrap(), "yes");
    }

    #[test]
    fn test_delivery_error_accessors() {
        let err = DeliveryError::Fatal {
            status: Some(400),
            message: "bad".to_string(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.message(), "bad");
    }
}
