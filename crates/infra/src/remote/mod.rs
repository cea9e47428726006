//! Remote provisioning API client.
//!
//! ## Components
//!
//! - `Transport`: the network seam (`HttpTransport` in production, scripted
//!   fakes in tests)
//! - `RetryPolicy`: backoff schedule plus a generic retry runner
//! - `CircuitBreakerRegistry`: per-endpoint breaker state behind one mutex
//! - `ProvisioningClient`: `invoke()` combining all of the above

pub mod breaker;
pub mod client;
pub mod error;
pub mod http;
pub mod provisioning;
pub mod retry;
pub mod types;

pub use breaker::{BreakerSettings, CircuitBreakerRegistry, CircuitState};
pub use client::ProvisioningClient;
pub use error::{ApiError, TransportError};
pub use http::HttpTransport;
pub use provisioning::{
    ExternalRequest, ProductCapacity, RequestStatus, action_request, product_capacity_request,
    pending_requests_request,
};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use types::{ApiRequest, ApiResponse, Method, Transport};
