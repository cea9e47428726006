//! Service configuration.
//!
//! One JSON document, camelCase keys, every field defaulted so a partial file
//! (or none at all) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use seatflow_allocation::OptimizationPolicy;
use seatflow_core::ProductId;
use seatflow_inventory::ActivityThresholds;
use seatflow_observability::LoggingConfig;

use crate::remote::{BackoffStrategy, BreakerSettings, RetryPolicy};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "SEATFLOW_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub thresholds: ThresholdConfig,
    pub activity: ActivityConfig,
    pub default_product: Option<ProductId>,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub ledger_path: Option<PathBuf>,
    pub inventory_path: Option<PathBuf>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThresholdConfig {
    pub reclaim_days: u32,
    pub downgrade_days: u32,
    pub max_products_before_downgrade: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            reclaim_days: 60,
            downgrade_days: 15,
            max_products_before_downgrade: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActivityConfig {
    /// Upper bounds (days) of the active, cooling, idle and inactive tiers.
    pub tier_days: [u32; 4],
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            tier_days: [15, 30, 60, 90],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// `"exponential"` or `"fixed"`.
    pub strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 6,
            open_duration_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub lease_timeout_ms: u64,
    pub max_retries: u32,
    pub dequeue_timeout_ms: u64,
    /// Durable queue file; in-memory queue when unset.
    pub store_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: 300_000,
            max_retries: 5,
            dequeue_timeout_ms: 1_000,
            store_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteConfig {
    pub base_url: String,
    pub org_id: String,
    pub request_timeout_ms: u64,
    /// Upper bound on a server-provided `Retry-After`.
    pub max_retry_after_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://usermanagement.adobe.io".to_string(),
            org_id: String::new(),
            request_timeout_ms: 30_000,
            max_retry_after_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Queue priority of provision jobs created from approved requests.
    pub approval_priority: u8,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            approval_priority: 2,
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `SEATFLOW_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(PathBuf::from(path)),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.workers.pool_size == 0 {
            return invalid("workers.poolSize must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.maxAttempts must be at least 1");
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier <= 1.0 {
            return invalid("retry.backoffMultiplier must be greater than 1");
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry delays must satisfy 0 < baseDelayMs <= maxDelayMs");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuitBreaker.failureThreshold must be at least 1");
        }
        if self.thresholds.downgrade_days >= self.thresholds.reclaim_days {
            return invalid("thresholds.downgradeDays must be below reclaimDays");
        }
        if self.thresholds.max_products_before_downgrade == 0 {
            return invalid("thresholds.maxProductsBeforeDowngrade must be at least 1");
        }
        if self.queue.lease_timeout_ms == 0 {
            return invalid("queue.leaseTimeoutMs must be positive");
        }
        if self.sync.interval_secs == 0 {
            return invalid("sync.intervalSecs must be positive");
        }
        self.activity_thresholds()?;
        Ok(())
    }

    pub fn activity_thresholds(&self) -> Result<ActivityThresholds, ConfigError> {
        ActivityThresholds::from_days(self.activity.tier_days)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Backoff schedule shared by the remote client, queue requeues and the
    /// sync loop.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.backoff_multiplier,
            Duration::from_millis(self.retry.max_delay_ms),
        )
        .with_strategy(self.retry.strategy)
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.circuit_breaker.failure_threshold,
            open_duration: Duration::from_millis(self.circuit_breaker.open_duration_ms),
        }
    }

    /// Optimizer policy for a run starting at `reference_time`.
    pub fn optimization_policy(
        &self,
        reference_time: chrono::DateTime<chrono::Utc>,
    ) -> OptimizationPolicy {
        let mut policy = OptimizationPolicy::new(reference_time).with_thresholds(
            self.thresholds.reclaim_days,
            self.thresholds.downgrade_days,
            self.thresholds.max_products_before_downgrade,
        );
        if let Some(product) = &self.default_product {
            policy = policy.with_default_product(product.clone());
        }
        policy
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.lease_timeout_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.dequeue_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.request_timeout_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.remote.max_retry_after_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }
}
