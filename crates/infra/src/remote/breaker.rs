//! Per-endpoint circuit breakers.
//!
//! Every endpoint's state lives in one map behind one mutex, so the
//! consecutive-failure counter cannot lose updates when many workers fail at
//! once. The lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::ApiError;

/// How long callers wait while another caller's half-open probe is pending.
const PROBE_PENDING_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Cool-down before a half-open probe is allowed.
    pub open_duration: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 6,
            open_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct EndpointBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl EndpointBreaker {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    endpoints: Mutex<HashMap<String, EndpointBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc(settings: BreakerSettings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    /// Ask to call `endpoint`. Fails fast with `CircuitOpen` while the breaker
    /// is open or a half-open probe is already out.
    pub fn acquire(&self, endpoint: &str) -> Result<BreakerPermit<'_>, ApiError> {
        let mut endpoints = self.lock();
        let breaker = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointBreaker::closed);

        let probe = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = breaker.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed < self.settings.open_duration {
                    return Err(ApiError::CircuitOpen {
                        endpoint: endpoint.to_string(),
                        retry_in: self.settings.open_duration - elapsed,
                    });
                }
                info!(endpoint, "circuit half-open, allowing one probe");
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    return Err(ApiError::CircuitOpen {
                        endpoint: endpoint.to_string(),
                        retry_in: PROBE_PENDING_RETRY,
                    });
                }
                breaker.probe_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            registry: self,
            endpoint: endpoint.to_string(),
            probe,
            resolved: false,
        })
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.lock()
            .get(endpoint)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn consecutive_failures(&self, endpoint: &str) -> u32 {
        self.lock()
            .get(endpoint)
            .map(|b| b.consecutive_failures)
            .unwrap_or(0)
    }

    fn record(&self, endpoint: &str, probe: bool, outcome: Outcome) {
        let mut endpoints = self.lock();
        let Some(breaker) = endpoints.get_mut(endpoint) else {
            return;
        };
        if probe {
            breaker.probe_in_flight = false;
        }
        match outcome {
            Outcome::Success => {
                if breaker.state != CircuitState::Closed {
                    info!(endpoint, "circuit closed after successful probe");
                }
                *breaker = EndpointBreaker::closed();
            }
            Outcome::Failure => {
                breaker.consecutive_failures += 1;
                let reopen = breaker.state == CircuitState::HalfOpen;
                if reopen || breaker.consecutive_failures >= self.settings.failure_threshold {
                    if breaker.state != CircuitState::Open {
                        warn!(
                            endpoint,
                            failures = breaker.consecutive_failures,
                            open_for_ms = self.settings.open_duration.as_millis() as u64,
                            "circuit opened"
                        );
                    }
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
            Outcome::Neutral => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EndpointBreaker>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Permission for one call. Resolve it with the call's outcome; dropping an
/// unresolved probe frees the half-open slot without changing state.
#[derive(Debug)]
#[must_use = "resolve the permit with the call outcome"]
pub struct BreakerPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    endpoint: String,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The remote answered.
    pub fn success(mut self) {
        self.resolve(Outcome::Success);
    }

    /// Transient failure: timeout, connection error, 5xx.
    pub fn failure(mut self) {
        self.resolve(Outcome::Failure);
    }

    /// Neither healthy nor failing (rate limited).
    pub fn neutral(mut self) {
        self.resolve(Outcome::Neutral);
    }

    fn resolve(&mut self, outcome: Outcome) {
        self.resolved = true;
        self.registry.record(&self.endpoint, self.probe, outcome);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.registry.record(&self.endpoint, self.probe, Outcome::Neutral);
        }
    }
}
