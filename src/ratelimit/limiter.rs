//! Adaptive, process-local admission control.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::events::{EventBus, EventKind, RateLimitEvent};
use super::metrics::AdaptiveMetrics;
use super::permission::{ApiErrorKind, DenyReason, Permission, RequestTicket};
use super::strategy::{ProcessingStrategy, RateLimitConfig};
use super::window::SlidingWindow;
use crate::clock::{millis_until_next_minute, system_clock, SharedClock};
use crate::error::Result;

/// Base delay for the first backoff step.
const BASE_BACKOFF_MS: f64 = 1_000.0;
/// Retry hint when every concurrency slot is taken.
const CONCURRENT_RETRY_MS: u64 = 1_000;
/// Minimum time between adaptive scaling evaluations.
const ADJUSTMENT_INTERVAL_MS: i64 = 30_000;

const SCALE_UP_FACTOR: f64 = 1.1;
const SCALE_DOWN_FACTOR: f64 = 0.8;
const MAX_REQUESTS_PER_MINUTE: u32 = 200;
const MAX_TOKENS_PER_MINUTE: u64 = 300_000;
const MIN_REQUESTS_PER_MINUTE: u32 = 10;
const MIN_TOKENS_PER_MINUTE: u64 = 10_000;

/// Usage counters of one limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaTracker {
    /// Requests admitted and not yet completed
    pub current_requests: u32,
    pub requests_in_last_minute: u64,
    pub tokens_in_last_minute: u64,
    /// Last time the window dropped expired records
    pub last_reset_time: DateTime<Utc>,
    pub consecutive_errors: u32,
    pub current_backoff_ms: u64,
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterStatus {
    pub config: RateLimitConfig,
    pub tracker: QuotaTracker,
    /// Remaining backoff, 0 when not backing off
    pub backoff_remaining_ms: u64,
    pub metrics: AdaptiveMetrics,
}

#[derive(Debug)]
struct LimiterState {
    config: RateLimitConfig,
    tracker: QuotaTracker,
    window: SlidingWindow,
    metrics: AdaptiveMetrics,
    /// Epoch ms at which the current backoff ends
    backoff_until_ms: Option<i64>,
    /// Epoch ms of the last admitted request
    last_request_ms: Option<i64>,
}

impl LimiterState {
    fn evict(&mut self, now: DateTime<Utc>) {
        let evicted = self.window.evict(now.timestamp_millis());
        if evicted > 0 {
            self.tracker.last_reset_time = now;
        }
        self.sync_counters();
    }

    fn sync_counters(&mut self) {
        self.tracker.requests_in_last_minute = self.window.request_count();
        self.tracker.tokens_in_last_minute = self.window.token_count();
    }

    fn backoff_remaining(&self, now_ms: i64) -> u64 {
        match self.backoff_until_ms {
            Some(until) if until > now_ms => (until - now_ms) as u64,
            _ => 0,
        }
    }

    /// Scale throughput ceilings from observed outcomes.
    fn maybe_adjust(&mut self, now: DateTime<Utc>) {
        if !self.config.adaptive_scaling {
            return;
        }
        let since = now.timestamp_millis() - self.metrics.last_adjustment.timestamp_millis();
        if since < ADJUSTMENT_INTERVAL_MS {
            return;
        }

        let (old_rpm, old_tpm) = (self.config.requests_per_minute, self.config.tokens_per_minute);
        let success_rate = self.metrics.success_rate;
        let error_rate = self.metrics.error_rate;

        if success_rate > 0.95 && error_rate < 0.05 {
            self.config.requests_per_minute = scale_u32(old_rpm, SCALE_UP_FACTOR)
                .min(MAX_REQUESTS_PER_MINUTE)
                .max(old_rpm);
            self.config.tokens_per_minute = scale_u64(old_tpm, SCALE_UP_FACTOR)
                .min(MAX_TOKENS_PER_MINUTE)
                .max(old_tpm);
        } else if success_rate < 0.8 || error_rate > 0.2 {
            self.config.requests_per_minute = scale_u32(old_rpm, SCALE_DOWN_FACTOR)
                .max(MIN_REQUESTS_PER_MINUTE)
                .min(old_rpm);
            self.config.tokens_per_minute = scale_u64(old_tpm, SCALE_DOWN_FACTOR)
                .max(MIN_TOKENS_PER_MINUTE)
                .min(old_tpm);
        }

        if (old_rpm, old_tpm) != (self.config.requests_per_minute, self.config.tokens_per_minute) {
            info!(
                success_rate,
                error_rate,
                old_rpm,
                new_rpm = self.config.requests_per_minute,
                old_tpm,
                new_tpm = self.config.tokens_per_minute,
                "Adaptive scaling adjusted limits"
            );
        }
        self.metrics.mark_adjusted(now);
    }

    /// Steps 3 to 6 of admission: the first check that fails wins.
    fn check(&self, estimated_tokens: u64, now_ms: i64) -> Option<(DenyReason, u64)> {
        let backoff = self.backoff_remaining(now_ms);
        if backoff > 0 {
            return Some((DenyReason::BackoffPeriod, backoff));
        }

        if self.tracker.current_requests >= self.config.max_concurrent_requests {
            return Some((DenyReason::ConcurrentLimit, CONCURRENT_RETRY_MS));
        }

        if self.tracker.requests_in_last_minute >= u64::from(self.config.requests_per_minute) {
            return Some((DenyReason::RequestsLimit, millis_until_next_minute(now_ms)));
        }
        if self.tracker.tokens_in_last_minute.saturating_add(estimated_tokens)
            > self.config.tokens_per_minute
        {
            return Some((DenyReason::TokensLimit, millis_until_next_minute(now_ms)));
        }

        if let Some(last) = self.last_request_ms {
            let elapsed = (now_ms - last).max(0) as u64;
            let min_interval = self.config.min_interval_ms();
            if elapsed < min_interval
                && self.tracker.requests_in_last_minute > u64::from(self.config.burst_allowance)
            {
                return Some((DenyReason::BurstLimit, min_interval - elapsed));
            }
        }

        None
    }

    fn complete(&mut self) {
        self.tracker.current_requests = self.tracker.current_requests.saturating_sub(1);
    }
}

fn scale_u32(value: u32, factor: f64) -> u32 {
    (f64::from(value) * factor).round() as u32
}

fn scale_u64(value: u64, factor: f64) -> u64 {
    (value as f64 * factor).round() as u64
}

/// In-process gatekeeper for provider calls.
///
/// All state sits behind a single mutex: eviction, limit checks and recording
/// happen as one step per call. The limiter never blocks; denied callers are
/// told how long to wait and retry on their own.
pub struct AdaptiveRateLimiter {
    state: Mutex<LimiterState>,
    events: Arc<EventBus>,
    clock: SharedClock,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl AdaptiveRateLimiter {
    /// Create a limiter on the system clock with its own event bus.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_parts(config, system_clock(), Arc::new(EventBus::new()))
    }

    /// Create a limiter from a named preset.
    pub fn from_strategy(strategy: ProcessingStrategy) -> Self {
        Self::new(strategy.config())
    }

    /// Create a limiter from a preset name such as `"balanced"`.
    pub fn from_strategy_name(name: &str) -> Result<Self> {
        Ok(Self::from_strategy(name.parse()?))
    }

    /// Create a limiter with an explicit clock and event bus.
    pub fn with_parts(config: RateLimitConfig, clock: SharedClock, events: Arc<EventBus>) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(LimiterState {
                config,
                tracker: QuotaTracker {
                    current_requests: 0,
                    requests_in_last_minute: 0,
                    tokens_in_last_minute: 0,
                    last_reset_time: now,
                    consecutive_errors: 0,
                    current_backoff_ms: 0,
                },
                window: SlidingWindow::new(),
                metrics: AdaptiveMetrics::new(now),
                backoff_until_ms: None,
                last_request_ms: None,
            }),
            events,
            clock,
        }
    }

    /// Event bus this limiter publishes to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Decide whether a request estimated at `estimated_tokens` may go out now.
    pub fn acquire_permission(&self, estimated_tokens: u64) -> Permission {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        let (permission, event) = {
            let mut state = self.state.lock();
            state.evict(now);
            state.maybe_adjust(now);

            match state.check(estimated_tokens, now_ms) {
                Some((reason, delay_ms)) => {
                    debug!(
                        reason = %reason,
                        delay_ms,
                        in_flight = state.tracker.current_requests,
                        requests_in_window = state.tracker.requests_in_last_minute,
                        tokens_in_window = state.tracker.tokens_in_last_minute,
                        "Permission denied"
                    );
                    (
                        Permission::denied(reason, delay_ms),
                        RateLimitEvent::new(EventKind::PermissionDenied, now)
                            .with_reason(reason)
                            .with_delay(delay_ms)
                            .with_tokens(estimated_tokens),
                    )
                }
                None => {
                    let ticket = state.window.push(now_ms, estimated_tokens);
                    state.tracker.current_requests += 1;
                    state.last_request_ms = Some(now_ms);
                    state.sync_counters();
                    trace!(
                        ticket = ticket.0,
                        estimated_tokens,
                        in_flight = state.tracker.current_requests,
                        "Permission granted"
                    );
                    (
                        Permission::granted(ticket),
                        RateLimitEvent::new(EventKind::PermissionGranted, now)
                            .with_tokens(estimated_tokens),
                    )
                }
            }
        };

        self.events.emit(event);
        permission
    }

    /// Record a completed call, reconciling against the newest window record.
    pub fn record_success(&self, actual_tokens: u64, response_time_ms: Option<u64>) {
        self.finish_success(None, actual_tokens, response_time_ms);
    }

    /// Record a completed call, reconciling against the record of `ticket`.
    pub fn record_success_for(
        &self,
        ticket: RequestTicket,
        actual_tokens: u64,
        response_time_ms: Option<u64>,
    ) {
        self.finish_success(Some(ticket), actual_tokens, response_time_ms);
    }

    fn finish_success(
        &self,
        ticket: Option<RequestTicket>,
        actual_tokens: u64,
        response_time_ms: Option<u64>,
    ) {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            state.complete();
            state.tracker.consecutive_errors = 0;

            let delta = match ticket {
                Some(ticket) => state.window.reconcile(ticket, actual_tokens),
                None => state.window.reconcile_last(actual_tokens),
            };
            state.sync_counters();

            let requests = state.tracker.requests_in_last_minute;
            state.metrics.record_success(response_time_ms, requests);

            trace!(
                actual_tokens,
                token_delta = ?delta,
                response_time_ms = ?response_time_ms,
                in_flight = state.tracker.current_requests,
                "Recorded success"
            );
        }

        self.events
            .emit(RateLimitEvent::new(EventKind::Success, now).with_tokens(actual_tokens));
    }

    /// Record a failed call. Only `RateLimit` errors start a backoff.
    pub fn record_error(&self, error_type: ApiErrorKind) {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        let backoff = {
            let mut state = self.state.lock();
            state.complete();
            state.tracker.consecutive_errors = state.tracker.consecutive_errors.saturating_add(1);

            let backoff = if error_type == ApiErrorKind::RateLimit {
                let backoff_ms = backoff_delay(
                    state.config.backoff_multiplier,
                    state.tracker.consecutive_errors,
                    state.config.max_backoff_ms,
                );
                state.tracker.current_backoff_ms = backoff_ms;
                state.backoff_until_ms = Some(now_ms + backoff_ms as i64);
                debug!(
                    consecutive_errors = state.tracker.consecutive_errors,
                    backoff_ms,
                    "Applying backoff after provider rate limit"
                );
                Some(backoff_ms)
            } else {
                None
            };

            let requests = state.tracker.requests_in_last_minute;
            state.metrics.record_failure(requests);
            backoff
        };

        if let Some(backoff_ms) = backoff {
            self.events.emit(
                RateLimitEvent::new(EventKind::BackoffApplied, now)
                    .with_delay(backoff_ms)
                    .with_error(error_type),
            );
        }
        self.events
            .emit(RateLimitEvent::new(EventKind::Error, now).with_error(error_type));
    }

    /// Free the concurrency slot of a request that never reached the provider.
    ///
    /// Window records, metrics and error counts are left as they are.
    pub fn release(&self, ticket: Option<RequestTicket>) {
        let mut state = self.state.lock();
        state.complete();
        trace!(
            ticket = ?ticket.map(|t| t.0),
            in_flight = state.tracker.current_requests,
            "Released slot"
        );
    }

    /// Count requests admitted by a previous limiter as in flight here.
    pub fn adopt_in_flight(&self, count: u32) {
        let mut state = self.state.lock();
        state.tracker.current_requests = state.tracker.current_requests.saturating_add(count);
    }

    /// Snapshot of configuration, counters and metrics.
    pub fn status(&self) -> LimiterStatus {
        let now_ms = self.clock.now_millis();
        let state = self.state.lock();
        LimiterStatus {
            config: state.config.clone(),
            tracker: state.tracker.clone(),
            backoff_remaining_ms: state.backoff_remaining(now_ms),
            metrics: state.metrics.clone(),
        }
    }

    pub fn metrics(&self) -> AdaptiveMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn config(&self) -> RateLimitConfig {
        self.state.lock().config.clone()
    }

    /// Requests currently in flight.
    pub fn in_flight(&self) -> u32 {
        self.state.lock().tracker.current_requests
    }
}

/// `min(1000 * multiplier^consecutive_errors, max_backoff_ms)`
pub fn backoff_delay(multiplier: f64, consecutive_errors: u32, max_backoff_ms: u64) -> u64 {
    let exponent = consecutive_errors.min(i32::MAX as u32) as i32;
    let delay = BASE_BACKOFF_MS * multiplier.powi(exponent);
    if !delay.is_finite() || delay >= max_backoff_ms as f64 {
        max_backoff_ms
    } else {
        delay.round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use parking_lot::Mutex as PlMutex;

    // Noon on 2024-01-01, aligned to a minute boundary
    const START_MS: i64 = 1_704_110_400_000;

    fn scenario_config() -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent_requests: 1,
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            burst_allowance: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            adaptive_scaling: false,
        }
    }

    fn limiter_with(config: RateLimitConfig) -> (AdaptiveRateLimiter, ManualClock) {
        let clock = ManualClock::at_millis(START_MS);
        let limiter = AdaptiveRateLimiter::with_parts(
            config,
            Arc::new(clock.clone()),
            Arc::new(EventBus::new()),
        );
        (limiter, clock)
    }

    fn wide_config() -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent_requests: 100,
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            burst_allowance: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            adaptive_scaling: false,
        }
    }

    #[test]
    fn test_second_request_hits_concurrency_limit() {
        let (limiter, _clock) = limiter_with(scenario_config());

        let first = limiter.acquire_permission(500);
        assert!(first.allowed);
        assert_eq!(first.delay_ms, 0);

        let second = limiter.acquire_permission(500);
        assert!(!second.allowed);
        assert_eq!(second.reason, Some(DenyReason::ConcurrentLimit));
        assert_eq!(second.delay_ms, 1_000);
    }

    #[test]
    fn test_allowed_request_increments_in_flight_by_one() {
        let (limiter, _clock) = limiter_with(wide_config());

        for tokens in [0, 1, 999, 10_000] {
            let before = limiter.in_flight();
            assert!(limiter.acquire_permission(tokens).allowed);
            assert_eq!(limiter.in_flight(), before + 1);
        }
    }

    #[test]
    fn test_requests_limit_delay_is_time_to_next_minute() {
        let mut config = wide_config();
        config.requests_per_minute = 3;
        config.burst_allowance = 100;
        let (limiter, clock) = limiter_with(config);

        clock.advance_millis(12_345);
        for _ in 0..3 {
            assert!(limiter.acquire_permission(10).allowed);
        }

        let denied = limiter.acquire_permission(10);
        let now = clock.now_millis();
        assert_eq!(denied.reason, Some(DenyReason::RequestsLimit));
        assert_eq!(denied.delay_ms, (60_000 - now.rem_euclid(60_000)) as u64);
        assert_eq!(denied.delay_ms, 47_655);
    }

    #[test]
    fn test_tokens_limit() {
        let (limiter, _clock) = limiter_with(wide_config());

        assert!(limiter.acquire_permission(90_000).allowed);
        let denied = limiter.acquire_permission(10_001);
        assert_eq!(denied.reason, Some(DenyReason::TokensLimit));

        // Exactly at the ceiling is fine
        assert!(limiter.acquire_permission(10_000).allowed);
    }

    #[test]
    fn test_window_eviction_restores_capacity() {
        let mut config = wide_config();
        config.requests_per_minute = 2;
        let (limiter, clock) = limiter_with(config);

        assert!(limiter.acquire_permission(1).allowed);
        assert!(limiter.acquire_permission(1).allowed);
        assert_eq!(
            limiter.acquire_permission(1).reason,
            Some(DenyReason::RequestsLimit)
        );

        clock.advance_millis(60_000);
        assert!(limiter.acquire_permission(1).allowed);
        assert_eq!(limiter.status().tracker.requests_in_last_minute, 1);
    }

    #[test]
    fn test_burst_limit_after_allowance_used() {
        let mut config = wide_config();
        config.burst_allowance = 2;
        let (limiter, clock) = limiter_with(config);

        // Two requests beyond the first may skip pacing
        for _ in 0..3 {
            assert!(limiter.acquire_permission(1).allowed);
        }

        clock.advance_millis(400);
        let denied = limiter.acquire_permission(1);
        assert_eq!(denied.reason, Some(DenyReason::BurstLimit));
        assert_eq!(denied.delay_ms, 600);

        clock.advance_millis(600);
        assert!(limiter.acquire_permission(1).allowed);
    }

    #[test]
    fn test_rate_limit_backoff_sequence() {
        let (limiter, _clock) = limiter_with(wide_config());

        let mut observed = Vec::new();
        assert!(limiter.acquire_permission(1).allowed);
        for _ in 0..3 {
            limiter.record_error(ApiErrorKind::RateLimit);
            observed.push(limiter.status().tracker.current_backoff_ms);
        }

        assert_eq!(observed, vec![2_000, 4_000, 8_000]);
    }

    #[test]
    fn test_backoff_is_monotonic_and_plateaus() {
        let mut config = wide_config();
        config.max_backoff_ms = 10_000;
        let (limiter, _clock) = limiter_with(config);

        let mut previous = 0;
        for _ in 0..10 {
            limiter.record_error(ApiErrorKind::RateLimit);
            let current = limiter.status().tracker.current_backoff_ms;
            assert!(current >= previous);
            assert!(current <= 10_000);
            previous = current;
        }
        assert_eq!(previous, 10_000);
    }

    #[test]
    fn test_backoff_delay_helper() {
        assert_eq!(backoff_delay(2.0, 1, 30_000), 2_000);
        assert_eq!(backoff_delay(1.5, 2, 30_000), 2_250);
        assert_eq!(backoff_delay(2.0, 40, 30_000), 30_000);
        assert_eq!(backoff_delay(2.0, u32::MAX, 30_000), 30_000);
    }

    #[test]
    fn test_backoff_period_denies_until_expired() {
        let (limiter, clock) = limiter_with(wide_config());

        assert!(limiter.acquire_permission(1).allowed);
        limiter.record_error(ApiErrorKind::RateLimit);

        clock.advance_millis(500);
        let denied = limiter.acquire_permission(1);
        assert_eq!(denied.reason, Some(DenyReason::BackoffPeriod));
        assert_eq!(denied.delay_ms, 1_500);

        clock.advance_millis(1_500);
        assert!(limiter.acquire_permission(1).allowed);
    }

    #[test]
    fn test_non_rate_limit_errors_do_not_back_off() {
        let (limiter, _clock) = limiter_with(wide_config());

        assert!(limiter.acquire_permission(1).allowed);
        limiter.record_error(ApiErrorKind::Timeout);
        limiter.record_error(ApiErrorKind::ServerError);

        let status = limiter.status();
        assert_eq!(status.tracker.consecutive_errors, 2);
        assert_eq!(status.tracker.current_backoff_ms, 0);
        assert!(limiter.acquire_permission(1).allowed);
    }

    #[test]
    fn test_success_resets_consecutive_errors() {
        let (limiter, _clock) = limiter_with(wide_config());

        limiter.record_error(ApiErrorKind::Timeout);
        limiter.record_error(ApiErrorKind::Timeout);
        assert!(limiter.acquire_permission(1).allowed);
        limiter.record_success(1, Some(100));

        assert_eq!(limiter.status().tracker.consecutive_errors, 0);
    }

    #[test]
    fn test_success_reconciles_tokens() {
        let (limiter, _clock) = limiter_with(wide_config());

        let first = limiter.acquire_permission(500);
        let _second = limiter.acquire_permission(500);

        limiter.record_success_for(first.ticket.unwrap(), 1_200, None);
        assert_eq!(limiter.status().tracker.tokens_in_last_minute, 1_700);

        limiter.record_success(100, None);
        assert_eq!(limiter.status().tracker.tokens_in_last_minute, 1_300);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_release_frees_slot_only() {
        let (limiter, _clock) = limiter_with(scenario_config());

        let permission = limiter.acquire_permission(10);
        limiter.release(permission.ticket);

        let status = limiter.status();
        assert_eq!(status.tracker.current_requests, 0);
        assert_eq!(status.tracker.requests_in_last_minute, 1);
        assert_eq!(status.metrics.samples_since_adjustment, 0);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let (limiter, _clock) = limiter_with(wide_config());
        limiter.record_success(0, None);
        limiter.record_error(ApiErrorKind::Timeout);
        limiter.release(None);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_adaptive_scale_up() {
        let mut config = wide_config();
        config.adaptive_scaling = true;
        let (limiter, clock) = limiter_with(config);

        for _ in 0..5 {
            assert!(limiter.acquire_permission(100).allowed);
            limiter.record_success(100, Some(50));
        }

        clock.advance_millis(30_000);
        limiter.acquire_permission(1);

        let config = limiter.config();
        assert_eq!(config.requests_per_minute, 66);
        assert_eq!(config.tokens_per_minute, 110_000);
    }

    #[test]
    fn test_adaptive_scale_down_respects_floor() {
        let mut config = wide_config();
        config.adaptive_scaling = true;
        config.requests_per_minute = 11;
        config.tokens_per_minute = 11_000;
        let (limiter, clock) = limiter_with(config);

        for _ in 0..5 {
            limiter.record_error(ApiErrorKind::ServerError);
        }

        clock.advance_millis(30_000);
        limiter.acquire_permission(1);

        let config = limiter.config();
        assert_eq!(config.requests_per_minute, 10);
        assert_eq!(config.tokens_per_minute, 10_000);
    }

    #[test]
    fn test_adaptive_scale_up_respects_cap() {
        let mut config = wide_config();
        config.adaptive_scaling = true;
        config.requests_per_minute = 195;
        config.tokens_per_minute = 290_000;
        let (limiter, clock) = limiter_with(config);

        limiter.record_success(0, None);
        clock.advance_millis(30_000);
        limiter.acquire_permission(1);

        let config = limiter.config();
        assert_eq!(config.requests_per_minute, 200);
        assert_eq!(config.tokens_per_minute, 300_000);
    }

    #[test]
    fn test_idle_limiter_scales_up_after_interval() {
        let mut config = wide_config();
        config.adaptive_scaling = true;
        let (limiter, clock) = limiter_with(config);

        clock.advance_millis(29_999);
        limiter.acquire_permission(1);
        assert_eq!(limiter.config().requests_per_minute, 60);

        clock.advance_millis(1);
        limiter.acquire_permission(1);
        assert_eq!(limiter.config().requests_per_minute, 66);
        assert_eq!(limiter.config().tokens_per_minute, 110_000);
    }

    #[test]
    fn test_no_scaling_before_interval_since_last_evaluation() {
        let mut config = wide_config();
        config.adaptive_scaling = true;
        let (limiter, clock) = limiter_with(config);

        clock.advance_millis(30_000);
        limiter.acquire_permission(1);
        assert_eq!(limiter.config().requests_per_minute, 66);

        limiter.record_success(1, None);
        clock.advance_millis(10_000);
        limiter.acquire_permission(1);
        assert_eq!(limiter.config().requests_per_minute, 66);
        assert_eq!(limiter.metrics().last_adjustment.timestamp_millis(), START_MS + 30_000);
    }

    #[test]
    fn test_huge_actual_tokens_saturate() {
        let (limiter, _clock) = limiter_with(wide_config());

        assert!(limiter.acquire_permission(1).allowed);
        assert!(limiter.acquire_permission(1).allowed);
        limiter.record_success(u64::MAX, None);

        let status = limiter.status();
        assert_eq!(status.tracker.tokens_in_last_minute, u64::MAX);
        assert_eq!(status.tracker.current_requests, 1);
        assert_eq!(limiter.acquire_permission(1).reason, Some(DenyReason::TokensLimit));
    }

    #[test]
    fn test_static_config_never_scales() {
        let (limiter, clock) = limiter_with(wide_config());

        for _ in 0..5 {
            limiter.record_error(ApiErrorKind::ServerError);
        }
        clock.advance_millis(30_000);
        limiter.acquire_permission(1);
        assert_eq!(limiter.config().requests_per_minute, 60);
    }

    #[test]
    fn test_one_event_per_acquire_outcome() {
        let (limiter, _clock) = limiter_with(scenario_config());
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        limiter
            .events()
            .add_listener(Arc::new(move |e: &RateLimitEvent| -> anyhow::Result<()> {
                sink.lock().push(e.clone());
                Ok(())
            }));

        limiter.acquire_permission(5);
        limiter.acquire_permission(5);

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::PermissionGranted);
        assert_eq!(events[1].kind, EventKind::PermissionDenied);
        assert_eq!(events[1].reason, Some(DenyReason::ConcurrentLimit));
    }

    #[test]
    fn test_rate_limit_error_emits_backoff_then_error() {
        let (limiter, _clock) = limiter_with(wide_config());
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        limiter
            .events()
            .add_listener(Arc::new(move |e: &RateLimitEvent| -> anyhow::Result<()> {
                sink.lock().push(e.kind);
                Ok(())
            }));

        limiter.record_error(ApiErrorKind::RateLimit);
        limiter.record_error(ApiErrorKind::Timeout);

        assert_eq!(
            *seen.lock(),
            vec![EventKind::BackoffApplied, EventKind::Error, EventKind::Error]
        );
    }

    #[test]
    fn test_listener_may_read_status_during_emit() {
        let limiter = Arc::new(limiter_with(wide_config()).0);
        let observed = Arc::new(PlMutex::new(None));

        let weak = Arc::downgrade(&limiter);
        let sink = observed.clone();
        limiter
            .events()
            .add_listener(Arc::new(move |_: &RateLimitEvent| -> anyhow::Result<()> {
                if let Some(limiter) = weak.upgrade() {
                    *sink.lock() = Some(limiter.in_flight());
                }
                Ok(())
            }));

        limiter.acquire_permission(1);
        assert_eq!(*observed.lock(), Some(1));
    }

    #[test]
    fn test_from_strategy_name() {
        let limiter = AdaptiveRateLimiter::from_strategy_name("aggressive").unwrap();
        assert_eq!(limiter.config().requests_per_minute, 120);
        assert!(AdaptiveRateLimiter::from_strategy_name("yolo").is_err());
    }
}
