use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::breaker::CircuitBreakerRegistry;
use super::error::ApiError;
use super::retry::{RetryDecision, RetryPolicy};
use super::types::{ApiRequest, ApiResponse, Transport};

/// Client for the remote provisioning service.
///
/// Each attempt passes the endpoint's circuit breaker, is bounded by the
/// request timeout and is classified into the `ApiError` taxonomy. Transient
/// failures are retried with backoff; rate-limit responses wait for the
/// server's `Retry-After` when it is within `max_retry_after`.
#[derive(Clone)]
pub struct ProvisioningClient {
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    request_timeout: Duration,
    max_retry_after: Duration,
    org_id: String,
}

impl std::fmt::Debug for ProvisioningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningClient")
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .field("org_id", &self.org_id)
            .finish_non_exhaustive()
    }
}

impl ProvisioningClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            breakers,
            retry,
            request_timeout: Duration::from_secs(30),
            max_retry_after: Duration::from_secs(300),
            org_id: String::new(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = max;
        self
    }

    pub fn with_org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = org_id.into();
        self
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn invoke(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.retry
            .run(
                |err| self.classify(err),
                |attempt| self.attempt(request, attempt),
            )
            .await
    }

    fn classify(&self, err: &ApiError) -> RetryDecision {
        match err {
            ApiError::Transient { .. } => RetryDecision::Retry,
            ApiError::RateLimited {
                retry_after: Some(delay),
                ..
            } if *delay <= self.max_retry_after => RetryDecision::RetryAfter(*delay),
            ApiError::RateLimited {
                retry_after: None, ..
            } => RetryDecision::Retry,
            // Too long a Retry-After, permanent rejections, open breaker and
            // garbage bodies all go back to the caller.
            _ => RetryDecision::Stop,
        }
    }

    async fn attempt(&self, request: &ApiRequest, attempt: u32) -> Result<ApiResponse, ApiError> {
        let endpoint = request.endpoint.as_str();
        let permit = self.breakers.acquire(endpoint)?;
        debug!(endpoint, attempt, path = %request.path, probe = permit.is_probe(), "calling remote");

        let sent = tokio::time::timeout(self.request_timeout, self.transport.send(request)).await;
        let outcome = match sent {
            Err(_) => Err(ApiError::transient(endpoint, "request timed out")),
            Ok(Err(err)) => Err(ApiError::from_transport(endpoint, err)),
            Ok(Ok(response)) if response.is_success() => Ok(response),
            Ok(Ok(response)) => Err(ApiError::from_response(endpoint, &response)),
        };

        match &outcome {
            Ok(_) | Err(ApiError::Permanent { .. }) => permit.success(),
            Err(ApiError::Transient { .. }) => permit.failure(),
            Err(_) => permit.neutral(),
        }
        if let Err(err) = &outcome {
            warn!(endpoint, attempt, error = %err, "remote call failed");
        }
        outcome
    }
}
