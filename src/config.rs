//! Configuration management for Trustgate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TrustgateError};

/// Prefix for environment overrides, e.g. `TRUSTGATE__RATE_LIMITING__ENABLE_METRICS=false`.
const ENV_PREFIX: &str = "TRUSTGATE";

/// Main configuration for the Trustgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustgateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Reputation engine configuration
    #[serde(default)]
    pub reputation: ReputationConfig,

    /// Background cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML rule file loaded at startup
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Retry-after reported when no reset time is known
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: u64,

    /// Tolerance subtracted from the sliding-window look-back, in milliseconds
    #[serde(default = "default_clock_tolerance")]
    pub clock_tolerance_ms: u64,

    /// How long a system's rule set stays cached
    #[serde(default = "default_rule_cache_ttl")]
    pub rule_cache_ttl_secs: u64,

    /// Append a violation record for every denied request
    #[serde(default = "default_true")]
    pub enable_violation_tracking: bool,

    /// Write a metric row for every decision
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            default_retry_after_secs: default_retry_after(),
            clock_tolerance_ms: default_clock_tolerance(),
            rule_cache_ttl_secs: default_rule_cache_ttl(),
            enable_violation_tracking: true,
            enable_metrics: true,
        }
    }
}

impl RateLimitingConfig {
    pub fn clock_tolerance(&self) -> Duration {
        Duration::from_millis(self.clock_tolerance_ms)
    }

    pub fn rule_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rule_cache_ttl_secs)
    }
}

fn default_retry_after() -> u64 {
    60
}

fn default_clock_tolerance() -> u64 {
    1000
}

fn default_rule_cache_ttl() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Reputation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Scale user-scoped limits by reputation
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Credit allowed user-scoped requests as clean requests
    #[serde(default = "default_true")]
    pub track_clean_requests: bool,

    /// How long a user's reputation stays cached
    #[serde(default = "default_reputation_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            track_clean_requests: true,
            cache_ttl_secs: default_reputation_cache_ttl(),
        }
    }
}

impl ReputationConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_reputation_cache_ttl() -> u64 {
    300
}

/// Background cleanup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Seconds between cleanup cycles
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,

    /// Buckets whose last hit is older than this are purged
    #[serde(default = "default_bucket_retention")]
    pub bucket_retention_secs: u64,

    /// Violations older than this are purged
    #[serde(default = "default_violation_retention")]
    pub violation_retention_secs: u64,

    /// Metric rows older than this are purged
    #[serde(default = "default_metrics_retention")]
    pub metrics_retention_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            bucket_retention_secs: default_bucket_retention(),
            violation_retention_secs: default_violation_retention(),
            metrics_retention_secs: default_metrics_retention(),
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn bucket_retention(&self) -> Duration {
        Duration::from_secs(self.bucket_retention_secs)
    }

    pub fn violation_retention(&self) -> Duration {
        Duration::from_secs(self.violation_retention_secs)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_secs)
    }
}

fn default_cleanup_interval() -> u64 {
    600
}

fn default_bucket_retention() -> u64 {
    // 2 hours, comfortably past the longest sliding window
    7200
}

fn default_violation_retention() -> u64 {
    7 * 86400
}

fn default_metrics_retention() -> u64 {
    30 * 86400
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TrustgateConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TrustgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TrustgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with `TRUSTGATE__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TrustgateError::Config(e.to_string()))?;

        let config: TrustgateConfig = settings
            .try_deserialize()
            .map_err(|e| TrustgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.cleanup.interval_secs == 0 {
            return Err(TrustgateError::Config(
                "cleanup.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.default_retry_after_secs == 0 {
            return Err(TrustgateError::Config(
                "rate_limiting.default_retry_after_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
