//! Configuration management for quotagate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{QuotaGateError, Result};
use crate::ratelimit::{ProcessingStrategy, RateLimitConfig};

/// Prefix of environment variable overrides, e.g. `QUOTAGATE__QUOTA__PROVIDER`.
pub const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Shared quota ledger configuration
    #[serde(default)]
    pub quota: QuotaSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Preset to start from
    #[serde(default)]
    pub strategy: ProcessingStrategy,

    /// Explicit limits replacing the preset's values
    #[serde(default)]
    pub overrides: Option<RateLimitConfig>,
}

impl LimiterSettings {
    /// The limiter configuration these settings describe.
    pub fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        let config = self
            .overrides
            .clone()
            .unwrap_or_else(|| self.strategy.config());
        config.validate()?;
        Ok(config)
    }
}

/// Shared quota ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSettings {
    /// Whether to consult and update the shared ledger
    #[serde(default = "default_persistent_tracking")]
    pub persistent_tracking: bool,

    /// Provider account name used as the ledger key
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Ledger read cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Days of ledger rows kept by cleanup
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds between cleanup runs
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl QuotaSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            persistent_tracking: default_persistent_tracking(),
            provider: default_provider(),
            cache_ttl_secs: default_cache_ttl(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_persistent_tracking() -> bool {
    true
}

fn default_provider() -> String {
    "gemini".to_string()
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_interval() -> u64 {
    3600
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
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

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaGateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.limiter.rate_limit_config()?;
        Ok(config)
    }

    /// Load defaults, then the optional file, then `QUOTAGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.limiter.rate_limit_config()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.limiter.strategy, ProcessingStrategy::Balanced);
        assert!(config.quota.persistent_tracking);
        assert_eq!(config.quota.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.quota.retention_days, 7);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
limiter:
  strategy: aggressive
quota:
  provider: openai
  persistent_tracking: false
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.strategy, ProcessingStrategy::Aggressive);
        assert_eq!(config.quota.provider, "openai");
        assert!(!config.quota.persistent_tracking);
        assert_eq!(config.quota.cleanup_interval_secs, 3600);

        let limits = config.limiter.rate_limit_config().unwrap();
        assert_eq!(limits.requests_per_minute, 120);
    }

    #[test]
    fn test_overrides_replace_preset() {
        let yaml = r#"
limiter:
  strategy: conservative
  overrides:
    max_concurrent_requests: 1
    requests_per_minute: 60
    tokens_per_minute: 100000
    burst_allowance: 10
    backoff_multiplier: 2.0
    max_backoff_ms: 30000
    adaptive_scaling: false
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        let limits = config.limiter.rate_limit_config().unwrap();
        assert_eq!(limits.max_concurrent_requests, 1);
        assert_eq!(limits.requests_per_minute, 60);
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let yaml = r#"
limiter:
  overrides:
    max_concurrent_requests: 0
    requests_per_minute: 60
    tokens_per_minute: 100000
    burst_allowance: 10
    backoff_multiplier: 2.0
    max_backoff_ms: 30000
    adaptive_scaling: false
"#;
        assert!(matches!(AppConfig::from_yaml(yaml), Err(QuotaGateError::Config(_))));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let yaml = "limiter:\n  strategy: turbo\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.quota.provider, "gemini");
    }
}
