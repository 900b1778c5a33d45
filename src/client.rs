//! Service client for the internal inference services
//!
//! One call, one outcome: the client enforces the timeout it is given and
//! translates every transport failure into a [`ServiceError`]. It never retries;
//! retry policy belongs to the executor so the budget is shared per request.

use crate::error::StageErrorKind;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Upstream messages longer than this are cut before they are recorded
const MAX_UPSTREAM_MESSAGE_LEN: usize = 200;

/// Successful response of an inference service
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("cannot reach {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("{endpoint} did not respond within {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("{endpoint} returned {status}: {message}")]
    Upstream {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("malformed response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl ServiceError {
    pub fn connection(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(endpoint: &str, timeout: Duration) -> Self {
        Self::Timeout {
            endpoint: endpoint.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn upstream(endpoint: &str, status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            endpoint: endpoint.to_string(),
            status,
            message: message.into(),
        }
    }

    pub fn decode(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> StageErrorKind {
        match self {
            ServiceError::Connection { .. } => StageErrorKind::ConnectionError,
            ServiceError::Timeout { .. } => StageErrorKind::TimeoutError,
            ServiceError::Upstream { .. } => StageErrorKind::UpstreamError,
            ServiceError::Decode { .. } => StageErrorKind::DecodeError,
        }
    }

    /// Description without the endpoint, for response bodies.
    /// Internal service addresses stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ServiceError::Connection { message, .. } => format!("service unreachable: {message}"),
            ServiceError::Timeout { timeout_ms, .. } => {
                format!("service did not respond within {timeout_ms}ms")
            }
            ServiceError::Upstream { status, message, .. } => {
                format!("service returned {status}: {message}")
            }
            ServiceError::Decode { message, .. } => format!("malformed service response: {message}"),
        }
    }

    /// Transient failures worth another attempt: unreachable, slow, or a 5xx
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Connection { .. } | ServiceError::Timeout { .. } => true,
            ServiceError::Upstream { status, .. } => *status >= 500,
            ServiceError::Decode { .. } => false,
        }
    }
}

/// Client for inference service calls, injected into the executor
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// POST a JSON body to `endpoint`, bounded by `timeout`
    async fn invoke(
        &self,
        endpoint: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<RawResponse, ServiceError>;

    /// `GET {base_url}/health`
    async fn health(&self, base_url: &str, timeout: Duration) -> Result<(), ServiceError>;
}

/// reqwest-backed client. One instance is shared by all stages and requests;
/// the underlying connection pool is internally synchronized.
#[derive(Debug, Clone, Default)]
pub struct HttpServiceClient {
    client: reqwest::Client,
}

impl HttpServiceClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceClient for HttpServiceClient {
    async fn invoke(
        &self,
        endpoint: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<RawResponse, ServiceError> {
        debug!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "Calling inference service");

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(endpoint, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await.unwrap_or_default();
            return Err(ServiceError::upstream(
                endpoint,
                status.as_u16(),
                upstream_message(&bytes, status),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(endpoint, timeout, e))?;

        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ServiceError::decode(endpoint, format!("invalid JSON: {e}")))?;

        Ok(RawResponse {
            status: status.as_u16(),
            body,
        })
    }

    async fn health(&self, base_url: &str, timeout: Duration) -> Result<(), ServiceError> {
        let endpoint = format!("{}/health", base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&endpoint)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(&endpoint, timeout, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let bytes = response.bytes().await.unwrap_or_default();
            Err(ServiceError::upstream(
                &endpoint,
                status.as_u16(),
                upstream_message(&bytes, status),
            ))
        }
    }
}

fn map_transport_error(endpoint: &str, timeout: Duration, error: reqwest::Error) -> ServiceError {
    let error = error.without_url();
    if error.is_timeout() {
        ServiceError::timeout(endpoint, timeout)
    } else if error.is_decode() || error.is_body() {
        ServiceError::decode(endpoint, error.to_string())
    } else {
        ServiceError::connection(endpoint, error.to_string())
    }
}

/// Pull a human-readable message out of an error body.
/// Services answer `{"error": ...}`, `{"detail": ...}` or plain text.
fn upstream_message(body: &[u8], status: reqwest::StatusCode) -> String {
    let from_json = serde_json::from_slice::<Value>(body).ok().and_then(|value| {
        ["error", "detail", "message"]
            .iter()
            .find_map(|key| value.get(key))
            .map(|field| match field {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    });

    let message = from_json.unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    let message = if message.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("no message")
            .to_string()
    } else {
        message
    };

    truncate(message, MAX_UPSTREAM_MESSAGE_LEN)
}

fn truncate(mut message: String, max: usize) -> String {
    if message.len() > max {
        let mut cut = max;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("...");
    }
    message
}
