use std::time::Duration;

use thiserror::Error;

use super::types::ApiResponse;

/// Failure below HTTP: the request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Timeout, connection reset or 5xx. Retried per policy.
    #[error("transient failure calling {endpoint}: {message}")]
    Transient {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },
    #[error("rate limited by {endpoint} (retry after {retry_after:?})")]
    RateLimited {
        endpoint: String,
        retry_after: Option<Duration>,
    },
    /// 4xx other than 429. Never retried.
    #[error("{endpoint} rejected the request with status {status}: {message}")]
    Permanent {
        endpoint: String,
        status: u16,
        message: String,
    },
    /// Breaker open; the remote was not called.
    #[error("circuit open for {endpoint}, retry in {retry_in:?}")]
    CircuitOpen { endpoint: String, retry_in: Duration },
    #[error("unexpected response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl ApiError {
    pub fn transient(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            endpoint: endpoint.into(),
            status: None,
            message: message.into(),
        }
    }

    pub fn from_transport(endpoint: &str, err: TransportError) -> Self {
        Self::transient(endpoint, err.to_string())
    }

    /// Map a non-2xx response onto the taxonomy.
    pub fn from_response(endpoint: &str, response: &ApiResponse) -> Self {
        let status = response.status;
        let message = response_message(response);
        match status {
            429 => Self::RateLimited {
                endpoint: endpoint.to_string(),
                retry_after: response.retry_after,
            },
            408 | 500..=599 => Self::Transient {
                endpoint: endpoint.to_string(),
                status: Some(status),
                message,
            },
            _ => Self::Permanent {
                endpoint: endpoint.to_string(),
                status,
                message,
            },
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::Transient { endpoint, .. }
            | Self::RateLimited { endpoint, .. }
            | Self::Permanent { endpoint, .. }
            | Self::CircuitOpen { endpoint, .. }
            | Self::Decode { endpoint, .. } => endpoint,
        }
    }

    /// Whether a later attempt of the same job may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RateLimited { .. } | Self::CircuitOpen { .. }
        )
    }
}

fn response_message(response: &ApiResponse) -> String {
    match &response.body {
        serde_json::Value::Null => format!("HTTP {}", response.status),
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
