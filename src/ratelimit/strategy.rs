//! Rate limit configuration and named processing strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QuotaGateError;

/// Limits and backoff tuning for one [`AdaptiveRateLimiter`](super::AdaptiveRateLimiter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of requests in flight at once
    pub max_concurrent_requests: u32,
    /// Requests allowed in any trailing 60s window
    pub requests_per_minute: u32,
    /// Tokens allowed in any trailing 60s window
    pub tokens_per_minute: u64,
    /// Requests allowed to arrive faster than `60000 / requests_per_minute` apart
    pub burst_allowance: u32,
    /// Growth factor applied per consecutive error when backing off
    pub backoff_multiplier: f64,
    /// Ceiling for a single backoff period
    pub max_backoff_ms: u64,
    /// Whether the limiter tunes its own rpm/tpm ceilings
    pub adaptive_scaling: bool,
}

impl RateLimitConfig {
    /// Minimum spacing between requests before the burst allowance is consumed.
    pub fn min_interval_ms(&self) -> u64 {
        60_000 / u64::from(self.requests_per_minute.max(1))
    }

    /// Reject configurations the limiter cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(QuotaGateError::Config(
                "max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        if self.requests_per_minute == 0 {
            return Err(QuotaGateError::Config(
                "requests_per_minute must be greater than 0".to_string(),
            ));
        }
        if self.tokens_per_minute == 0 {
            return Err(QuotaGateError::Config(
                "tokens_per_minute must be greater than 0".to_string(),
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(QuotaGateError::Config(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        ProcessingStrategy::Balanced.config()
    }
}

/// Named presets callers choose between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStrategy {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
    Adaptive,
}

impl ProcessingStrategy {
    /// Every preset, in order of increasing throughput.
    pub const ALL: [ProcessingStrategy; 4] = [
        ProcessingStrategy::Conservative,
        ProcessingStrategy::Balanced,
        ProcessingStrategy::Adaptive,
        ProcessingStrategy::Aggressive,
    ];

    /// The fixed configuration for this preset.
    pub fn config(&self) -> RateLimitConfig {
        match self {
            ProcessingStrategy::Conservative => RateLimitConfig {
                max_concurrent_requests: 2,
                requests_per_minute: 30,
                tokens_per_minute: 50_000,
                burst_allowance: 5,
                backoff_multiplier: 2.5,
                max_backoff_ms: 60_000,
                adaptive_scaling: false,
            },
            ProcessingStrategy::Balanced => RateLimitConfig {
                max_concurrent_requests: 5,
                requests_per_minute: 60,
                tokens_per_minute: 100_000,
                burst_allowance: 10,
                backoff_multiplier: 2.0,
                max_backoff_ms: 30_000,
                adaptive_scaling: false,
            },
            ProcessingStrategy::Aggressive => RateLimitConfig {
                max_concurrent_requests: 10,
                requests_per_minute: 120,
                tokens_per_minute: 200_000,
                burst_allowance: 20,
                backoff_multiplier: 1.5,
                max_backoff_ms: 15_000,
                adaptive_scaling: false,
            },
            ProcessingStrategy::Adaptive => RateLimitConfig {
                max_concurrent_requests: 7,
                requests_per_minute: 90,
                tokens_per_minute: 150_000,
                burst_allowance: 15,
                backoff_multiplier: 2.0,
                max_backoff_ms: 30_000,
                adaptive_scaling: true,
            },
        }
    }

    /// Lowercase preset name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStrategy::Conservative => "conservative",
            ProcessingStrategy::Balanced => "balanced",
            ProcessingStrategy::Aggressive => "aggressive",
            ProcessingStrategy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStrategy {
    type Err = QuotaGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(ProcessingStrategy::Conservative),
            "balanced" => Ok(ProcessingStrategy::Balanced),
            "aggressive" => Ok(ProcessingStrategy::Aggressive),
            "adaptive" => Ok(ProcessingStrategy::Adaptive),
            other => Err(QuotaGateError::InvalidInput(format!(
                "unknown processing strategy '{}'",
                other
            ))),
        }
    }
}
