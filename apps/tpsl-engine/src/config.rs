//! Engine configuration.
//!
//! All fields carry serde defaults so a partial config file (or none at
//! all) yields a fully working engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::pnl::DEFAULT_COMMISSION_RATE;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Commission rate applied to notional volume on every close.
    #[serde(default = "default_commission_rate")]
    pub commission_rate: Decimal,
    /// Interval between scheduled monitoring ticks per order.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum lifetime of a monitoring job before it self-expires.
    #[serde(default = "default_max_job_lifetime_secs")]
    pub max_job_lifetime_secs: u64,
    /// Consecutive per-order failures before dead-lettering.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Maximum simultaneous job executions.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// How long a worker waits for a first price before skipping a tick.
    #[serde(default = "default_price_wait_ms")]
    pub price_wait_ms: u64,
    /// Cache age beyond which the price monitor reports itself unhealthy.
    #[serde(default = "default_price_stale_secs")]
    pub price_stale_secs: u64,
    /// Failed-fetch ceiling for the price monitor's health.
    #[serde(default = "default_max_failed_fetches")]
    pub max_failed_fetches: u32,
    /// Retry backoff applied after transient job failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Health aggregation thresholds.
    #[serde(default)]
    pub health: HealthConfig,
    /// Grace period for draining in-flight work on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
            poll_interval_ms: default_poll_interval_ms(),
            max_job_lifetime_secs: default_max_job_lifetime_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            worker_concurrency: default_worker_concurrency(),
            price_wait_ms: default_price_wait_ms(),
            price_stale_secs: default_price_stale_secs(),
            max_failed_fetches: default_max_failed_fetches(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl EngineConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Maximum job lifetime as a [`Duration`].
    #[must_use]
    pub const fn max_job_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_job_lifetime_secs)
    }

    /// Bounded price wait as a [`Duration`].
    #[must_use]
    pub const fn price_wait(&self) -> Duration {
        Duration::from_millis(self.price_wait_ms)
    }

    /// Staleness window as a [`Duration`].
    #[must_use]
    pub const fn price_stale_window(&self) -> Duration {
        Duration::from_secs(self.price_stale_secs)
    }

    /// Shutdown grace as a [`Duration`].
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Retry backoff configuration for transient job failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First retry delay.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Ceiling on the retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Exponential growth factor.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter factor for randomization (0.2 = plus or minus 20%).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Thresholds for the aggregated health verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Success rate below this marks the engine unhealthy (0.95 = 95%).
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// Recent error count above this marks the engine unhealthy.
    #[serde(default = "default_max_recent_errors")]
    pub max_recent_errors: u64,
    /// Rolling window over which rates are sampled.
    #[serde(default = "default_health_window_secs")]
    pub window_secs: u64,
    /// Interval between health aggregation runs.
    #[serde(default = "default_health_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_success_rate: default_min_success_rate(),
            max_recent_errors: default_max_recent_errors(),
            window_secs: default_health_window_secs(),
            check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

impl HealthConfig {
    /// Rolling window as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Check interval as a [`Duration`].
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

const fn default_commission_rate() -> Decimal {
    DEFAULT_COMMISSION_RATE
}

const fn default_poll_interval_ms() -> u64 {
    5_000
}

const fn default_max_job_lifetime_secs() -> u64 {
    86_400 // 24h
}

const fn default_max_consecutive_failures() -> u32 {
    10
}

const fn default_worker_concurrency() -> usize {
    5
}

const fn default_price_wait_ms() -> u64 {
    3_000
}

const fn default_price_stale_secs() -> u64 {
    30
}

const fn default_max_failed_fetches() -> u32 {
    50
}

const fn default_initial_backoff_ms() -> u64 {
    1_000
}

const fn default_max_backoff_ms() -> u64 {
    60_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_jitter_factor() -> f64 {
    0.2
}

const fn default_min_success_rate() -> f64 {
    0.95
}

const fn default_max_recent_errors() -> u64 {
    25
}

const fn default_health_window_secs() -> u64 {
    300
}

const fn default_health_check_interval_secs() -> u64 {
    30
}

const fn default_shutdown_grace_ms() -> u64 {
    5_000
}
