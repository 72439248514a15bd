//! Composition of the local limiter and the shared quota ledger.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{millis_until_next_minute, system_clock, SharedClock};
use crate::error::{QuotaGateError, Result};
use crate::quota::{QuotaStatistics, QuotaTrackingService, QuotaType, QuotaUsage};
use crate::ratelimit::{
    AdaptiveRateLimiter, ApiErrorKind, DenyReason, EventBus, EventKind, LimiterStatus, Permission,
    ProcessingStrategy, RateLimitConfig, RateLimitEvent, RequestTicket,
};

/// Provider account limits the manager records usage against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
}

impl From<&RateLimitConfig> for QuotaLimits {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            requests_per_minute: u64::from(config.requests_per_minute),
            tokens_per_minute: config.tokens_per_minute,
        }
    }
}

/// Ledger view included in [`ManagerStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentStatus {
    pub limits: QuotaLimits,
    pub requests: Option<QuotaUsage>,
    pub tokens: Option<QuotaUsage>,
    pub requests_remaining: u64,
    pub tokens_remaining: u64,
    pub is_rate_limited: bool,
    /// Ledger calls that failed in a row
    pub consecutive_ledger_failures: u64,
    /// Set when the ledger could not be read for this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Combined local and ledger status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub api_provider: String,
    pub strategy: ProcessingStrategy,
    pub active_requests: usize,
    pub local: LimiterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<PersistentStatus>,
}

#[derive(Debug, Clone)]
struct ActiveRequest {
    ticket: Option<RequestTicket>,
    estimated_tokens: u64,
    admitted_at: DateTime<Utc>,
}

struct LimiterSlot {
    limiter: Arc<AdaptiveRateLimiter>,
    strategy: ProcessingStrategy,
}

/// Single entry point for gating provider calls.
///
/// `acquire_permission` consults the shared ledger first, when one is
/// configured, and the local limiter second. Outcomes are recorded in both.
/// Ledger failures never block traffic: reads fail open and writes are
/// dropped after logging.
pub struct RateLimitingManager {
    api_provider: String,
    slot: RwLock<LimiterSlot>,
    ledger: Option<Arc<QuotaTrackingService>>,
    limits: RwLock<QuotaLimits>,
    active: Mutex<HashMap<String, ActiveRequest>>,
    events: Arc<EventBus>,
    clock: SharedClock,
    ledger_failures: AtomicU64,
}

impl std::fmt::Debug for RateLimitingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitingManager")
            .field("api_provider", &self.api_provider)
            .field("strategy", &self.slot.read().strategy)
            .field("persistent_tracking", &self.ledger.is_some())
            .field("active_requests", &self.active.lock().len())
            .finish()
    }
}

impl RateLimitingManager {
    /// Create a manager from a preset on the system clock.
    ///
    /// Pass `None` as `ledger` to disable persistent tracking.
    pub fn new(
        api_provider: impl Into<String>,
        strategy: ProcessingStrategy,
        ledger: Option<Arc<QuotaTrackingService>>,
    ) -> Self {
        Self::with_config(api_provider, strategy, strategy.config(), ledger, system_clock())
    }

    /// Create a manager with an explicit limiter configuration and clock.
    pub fn with_config(
        api_provider: impl Into<String>,
        strategy: ProcessingStrategy,
        config: RateLimitConfig,
        ledger: Option<Arc<QuotaTrackingService>>,
        clock: SharedClock,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let limits = QuotaLimits::from(&config);
        let limiter = AdaptiveRateLimiter::with_parts(config, clock.clone(), events.clone());

        Self {
            api_provider: api_provider.into(),
            slot: RwLock::new(LimiterSlot {
                limiter: Arc::new(limiter),
                strategy,
            }),
            ledger,
            limits: RwLock::new(limits),
            active: Mutex::new(HashMap::new()),
            events,
            clock,
            ledger_failures: AtomicU64::new(0),
        }
    }

    pub fn api_provider(&self) -> &str {
        &self.api_provider
    }

    pub fn persistent_tracking(&self) -> bool {
        self.ledger.is_some()
    }

    /// Event bus shared by every limiter this manager creates.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn strategy(&self) -> ProcessingStrategy {
        self.slot.read().strategy
    }

    pub fn limits(&self) -> QuotaLimits {
        *self.limits.read()
    }

    /// The limiter currently in use.
    pub fn limiter(&self) -> Arc<AdaptiveRateLimiter> {
        self.slot.read().limiter.clone()
    }

    /// Ids of requests holding a permission.
    pub fn active_requests(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Ask whether `request_id` may call the provider now.
    ///
    /// Denials are returned as `Ok` values. Errors are reserved for caller
    /// mistakes, such as reusing the id of a request that is still active.
    pub async fn acquire_permission(
        &self,
        request_id: &str,
        estimated_tokens: u64,
    ) -> Result<Permission> {
        if self.active.lock().contains_key(request_id) {
            return Err(QuotaGateError::DuplicateRequest(request_id.to_string()));
        }

        if let Some(ledger) = &self.ledger {
            if let Some(denied) = self.check_ledger(ledger, estimated_tokens).await {
                debug!(
                    request_id,
                    reason = ?denied.reason,
                    delay_ms = denied.delay_ms,
                    "Permission denied by quota ledger"
                );
                return Ok(denied);
            }
        }

        let limiter = self.limiter();
        let permission = limiter.acquire_permission(estimated_tokens);
        if !permission.allowed {
            return Ok(permission);
        }

        let duplicate = {
            // Same lock order as update_strategy: slot, then active
            let slot = self.slot.read();
            let mut active = self.active.lock();
            match active.entry(request_id.to_string()) {
                Entry::Occupied(_) => true,
                Entry::Vacant(entry) => {
                    entry.insert(ActiveRequest {
                        ticket: permission.ticket,
                        estimated_tokens,
                        admitted_at: self.clock.now(),
                    });
                    // Granted by a limiter that was swapped out before the
                    // insert, so the switch did not count this request
                    if !Arc::ptr_eq(&slot.limiter, &limiter) {
                        slot.limiter.adopt_in_flight(1);
                    }
                    false
                }
            }
        };
        if duplicate {
            // Lost a race with another caller using the same id
            limiter.release(permission.ticket);
            return Err(QuotaGateError::DuplicateRequest(request_id.to_string()));
        }

        Ok(permission)
    }

    /// Evaluate the shared ledger. `None` means the ledger does not object.
    async fn check_ledger(
        &self,
        ledger: &QuotaTrackingService,
        estimated_tokens: u64,
    ) -> Option<Permission> {
        let limits = self.limits();
        let (requests, tokens) = futures::join!(
            ledger.get_quota_usage(&self.api_provider, QuotaType::Requests),
            ledger.get_quota_usage(&self.api_provider, QuotaType::Tokens),
        );
        let (requests, tokens) = match (requests, tokens) {
            (Ok(requests), Ok(tokens)) => {
                self.ledger_succeeded();
                (requests, tokens)
            }
            (Err(e), _) | (_, Err(e)) => {
                self.ledger_failed("read", &e);
                return None;
            }
        };

        let now = self.clock.now();
        let until_next_minute = millis_until_next_minute(now.timestamp_millis());
        let reset_delay = |usage: &QuotaUsage| {
            usage
                .rate_limit_reset_at
                .map(|reset| (reset - now).num_milliseconds().max(0) as u64)
                .unwrap_or(until_next_minute)
        };

        let (reason, delay_ms) = match (&requests, &tokens) {
            (Some(r), _) if r.is_limited_at(now) => {
                (DenyReason::PersistentRequestsLimit, reset_delay(r))
            }
            (_, Some(t)) if t.is_limited_at(now) => {
                (DenyReason::PersistentTokensLimit, reset_delay(t))
            }
            _ => {
                let requests_used = requests.as_ref().map_or(0, |r| r.quota_used);
                let tokens_used = tokens.as_ref().map_or(0, |t| t.quota_used);
                if limits.requests_per_minute.saturating_sub(requests_used) == 0 {
                    (DenyReason::PersistentRequestsExhausted, until_next_minute)
                } else if limits.tokens_per_minute.saturating_sub(tokens_used)
                    < estimated_tokens.max(1)
                {
                    (DenyReason::PersistentTokensExhausted, until_next_minute)
                } else {
                    return None;
                }
            }
        };

        self.events.emit(
            RateLimitEvent::new(EventKind::PermissionDenied, now)
                .with_reason(reason)
                .with_delay(delay_ms)
                .with_tokens(estimated_tokens),
        );
        Some(Permission::denied(reason, delay_ms))
    }

    fn take_active(&self, request_id: &str) -> Result<ActiveRequest> {
        self.active
            .lock()
            .remove(request_id)
            .ok_or_else(|| QuotaGateError::UnknownRequest(request_id.to_string()))
    }

    /// Record a completed provider call.
    pub async fn record_success(
        &self,
        request_id: &str,
        actual_tokens: u64,
        response_time_ms: Option<u64>,
    ) -> Result<()> {
        let request = self.take_active(request_id)?;
        let limiter = self.limiter();
        match request.ticket {
            Some(ticket) => limiter.record_success_for(ticket, actual_tokens, response_time_ms),
            None => limiter.record_success(actual_tokens, response_time_ms),
        }

        debug!(
            request_id,
            estimated_tokens = request.estimated_tokens,
            actual_tokens,
            held_ms = (self.clock.now() - request.admitted_at).num_milliseconds(),
            "Request succeeded"
        );

        if let Some(ledger) = &self.ledger {
            let limits = self.limits();
            let (requests, tokens) = futures::join!(
                ledger.record_usage(
                    &self.api_provider,
                    QuotaType::Requests,
                    1,
                    limits.requests_per_minute
                ),
                ledger.record_usage(
                    &self.api_provider,
                    QuotaType::Tokens,
                    actual_tokens,
                    limits.tokens_per_minute
                ),
            );
            self.observe_write(requests);
            self.observe_write(tokens);
        }
        Ok(())
    }

    /// Record a failed provider call.
    pub async fn record_error(&self, request_id: &str, error_type: ApiErrorKind) -> Result<()> {
        let request = self.take_active(request_id)?;
        self.limiter().record_error(error_type);

        debug!(
            request_id,
            error_type = %error_type,
            estimated_tokens = request.estimated_tokens,
            "Request failed"
        );

        if error_type == ApiErrorKind::RateLimit {
            if let Some(ledger) = &self.ledger {
                let limits = self.limits();
                let touched = ledger
                    .record_usage(
                        &self.api_provider,
                        QuotaType::Requests,
                        0,
                        limits.requests_per_minute,
                    )
                    .await;
                self.observe_write(touched);
            }
        }
        Ok(())
    }

    /// Drop a request that will not reach the provider.
    ///
    /// Its concurrency slot is freed; no success or error is recorded and the
    /// ledger is not touched. Returns `false` if the id was not active.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let Some(request) = self.active.lock().remove(request_id) else {
            return false;
        };
        self.limiter().release(request.ticket);
        debug!(request_id, "Request cancelled");
        true
    }

    /// Switch to another preset. Active requests keep their permissions.
    pub fn update_strategy(&self, strategy: ProcessingStrategy) {
        let config = strategy.config();
        let limits = QuotaLimits::from(&config);

        let mut slot = self.slot.write();
        let limiter =
            AdaptiveRateLimiter::with_parts(config, self.clock.clone(), self.events.clone());
        limiter.adopt_in_flight(self.active.lock().len() as u32);

        info!(
            from = %slot.strategy,
            to = %strategy,
            requests_per_minute = limits.requests_per_minute,
            tokens_per_minute = limits.tokens_per_minute,
            "Processing strategy updated"
        );

        *slot = LimiterSlot {
            limiter: Arc::new(limiter),
            strategy,
        };
        *self.limits.write() = limits;
    }

    /// Switch to a preset by name.
    pub fn update_strategy_name(&self, name: &str) -> Result<()> {
        self.update_strategy(name.parse()?);
        Ok(())
    }

    /// Local status merged with the ledger view when persistent tracking is on.
    pub async fn status(&self) -> ManagerStatus {
        let (local, strategy) = {
            let slot = self.slot.read();
            (slot.limiter.status(), slot.strategy)
        };

        let persistent = match &self.ledger {
            Some(ledger) => Some(self.persistent_status(ledger).await),
            None => None,
        };

        ManagerStatus {
            api_provider: self.api_provider.clone(),
            strategy,
            active_requests: self.active_count(),
            local,
            persistent,
        }
    }

    async fn persistent_status(&self, ledger: &QuotaTrackingService) -> PersistentStatus {
        let limits = self.limits();
        let now = self.clock.now();
        let (requests, tokens) = futures::join!(
            ledger.get_quota_usage(&self.api_provider, QuotaType::Requests),
            ledger.get_quota_usage(&self.api_provider, QuotaType::Tokens),
        );

        let mut error = None;
        let mut unwrap = |result: Result<Option<QuotaUsage>>| match result {
            Ok(usage) => usage,
            Err(e) => {
                error = Some(e.to_string());
                None
            }
        };
        let requests = unwrap(requests);
        let tokens = unwrap(tokens);

        let remaining = |usage: &Option<QuotaUsage>, limit: u64| {
            usage.as_ref().map_or(limit, |u| limit.saturating_sub(u.quota_used))
        };

        PersistentStatus {
            limits,
            requests_remaining: remaining(&requests, limits.requests_per_minute),
            tokens_remaining: remaining(&tokens, limits.tokens_per_minute),
            is_rate_limited: requests.iter().chain(tokens.iter()).any(|u| u.is_limited_at(now)),
            requests,
            tokens,
            consecutive_ledger_failures: self.ledger_failures.load(Ordering::Relaxed),
            error,
        }
    }

    /// Ledger totals over the trailing `hours`; `None` without persistent tracking.
    pub async fn quota_statistics(&self, hours: u32) -> Result<Option<QuotaStatistics>> {
        match &self.ledger {
            Some(ledger) => Ok(Some(ledger.get_quota_statistics(&self.api_provider, hours).await?)),
            None => Ok(None),
        }
    }

    /// Reset the current window of one quota; `false` without persistent tracking.
    pub async fn reset_quota(&self, quota_type: QuotaType) -> Result<bool> {
        match &self.ledger {
            Some(ledger) => ledger.reset_quota(&self.api_provider, quota_type, None).await,
            None => Ok(false),
        }
    }

    fn observe_write(&self, result: Result<QuotaUsage>) {
        match result {
            Ok(_) => self.ledger_succeeded(),
            Err(e) => self.ledger_failed("write", &e),
        }
    }

    fn ledger_succeeded(&self) {
        self.ledger_failures.store(0, Ordering::Relaxed);
    }

    fn ledger_failed(&self, operation: &str, error: &QuotaGateError) {
        let failures = self.ledger_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            provider = %self.api_provider,
            operation,
            consecutive_failures = failures,
            error = %error,
            "Quota ledger unavailable, continuing without it"
        );
    }
}
