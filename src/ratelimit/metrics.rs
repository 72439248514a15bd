//! Outcome metrics that drive adaptive scaling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smoothing factor for every moving average.
pub const EMA_ALPHA: f64 = 0.1;

/// Exponential moving averages of recent provider outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveMetrics {
    pub success_rate: f64,
    pub error_rate: f64,
    /// Milliseconds
    pub average_response_time: f64,
    /// Requests per minute observed at completion time
    pub throughput: f64,
    /// Last time the limits were evaluated for scaling
    pub last_adjustment: DateTime<Utc>,
    /// Outcomes recorded since `last_adjustment`
    #[serde(default)]
    pub samples_since_adjustment: u64,
}

impl AdaptiveMetrics {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            success_rate: 1.0,
            error_rate: 0.0,
            average_response_time: 0.0,
            throughput: 0.0,
            last_adjustment: now,
            samples_since_adjustment: 0,
        }
    }

    pub fn record_success(&mut self, response_time_ms: Option<u64>, requests_in_window: u64) {
        self.success_rate = ema(self.success_rate, 1.0);
        self.error_rate = ema(self.error_rate, 0.0);
        if let Some(rt) = response_time_ms {
            self.average_response_time = if self.average_response_time == 0.0 {
                rt as f64
            } else {
                ema(self.average_response_time, rt as f64)
            };
        }
        self.throughput = ema(self.throughput, requests_in_window as f64);
        self.samples_since_adjustment += 1;
    }

    pub fn record_failure(&mut self, requests_in_window: u64) {
        self.success_rate = ema(self.success_rate, 0.0);
        self.error_rate = ema(self.error_rate, 1.0);
        self.throughput = ema(self.throughput, requests_in_window as f64);
        self.samples_since_adjustment += 1;
    }

    pub fn mark_adjusted(&mut self, now: DateTime<Utc>) {
        self.last_adjustment = now;
        self.samples_since_adjustment = 0;
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * previous
}
