//! Shared quota ledger service.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::cache::TtlCache;
use super::key::{QuotaKey, QuotaType};
use super::store::{QuotaStore, QuotaUsage};
use crate::clock::{minute_floor, next_minute, system_clock, SharedClock};
use crate::error::Result;

/// Default lifetime of cached ledger rows.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Aggregated ledger usage over a trailing horizon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatistics {
    pub api_provider: String,
    pub hours: u32,
    pub total_requests: u64,
    pub total_tokens: u64,
    /// Windows in which either quota was flagged as rate limited
    pub rate_limited_windows: u64,
    /// Distinct minute windows with any recorded usage
    pub window_count: u64,
    pub average_requests_per_window: f64,
    pub average_tokens_per_window: f64,
}

/// Durable ledger of provider quota usage per minute window.
///
/// Every worker and process sharing one provider account writes to the same
/// store. Reads go through a short TTL cache, so a reader may lag other
/// writers by up to one TTL. Concurrent `record_usage` calls on the same row
/// race on read-modify-write; the loser's delta is dropped, which can only
/// under-count by the concurrent delta.
pub struct QuotaTrackingService {
    store: Arc<dyn QuotaStore>,
    cache: TtlCache<QuotaKey, QuotaUsage>,
    clock: SharedClock,
}

impl std::fmt::Debug for QuotaTrackingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTrackingService")
            .field("cache_ttl", &self.cache.ttl())
            .field("cached_rows", &self.cache.len())
            .finish()
    }
}

impl QuotaTrackingService {
    /// Create a service on the system clock with the default cache TTL.
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self::with_options(store, DEFAULT_CACHE_TTL, system_clock())
    }

    pub fn with_options(
        store: Arc<dyn QuotaStore>,
        cache_ttl: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            cache: TtlCache::new(cache_ttl, clock.clone()),
            clock,
        }
    }

    fn current_key(&self, api_provider: &str, quota_type: QuotaType) -> QuotaKey {
        QuotaKey::new(api_provider, quota_type, self.clock.now())
    }

    /// Add `usage_delta` to the current window's row, creating it if needed.
    ///
    /// A zero delta refreshes `updated_at` and the rate-limit flag without
    /// adding usage.
    pub async fn record_usage(
        &self,
        api_provider: &str,
        quota_type: QuotaType,
        usage_delta: u64,
        quota_limit: u64,
    ) -> Result<QuotaUsage> {
        let now = self.clock.now();
        let key = QuotaKey::new(api_provider, quota_type, now);

        let existing = self.store.get(&key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to read quota row");
            e
        })?;

        let mut usage = existing.unwrap_or_else(|| QuotaUsage::empty(&key, quota_limit, now));
        usage.quota_used = usage.quota_used.saturating_add(usage_delta);
        usage.quota_limit = quota_limit;
        usage.quota_remaining = quota_limit.saturating_sub(usage.quota_used);
        usage.is_rate_limited = usage.quota_used >= quota_limit;
        usage.rate_limit_reset_at = usage.is_rate_limited.then(|| next_minute(now));
        usage.updated_at = now;

        self.store.upsert(usage.clone()).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to write quota row");
            e
        })?;

        if usage.is_rate_limited {
            debug!(
                key = %key,
                used = usage.quota_used,
                limit = quota_limit,
                "Quota exhausted for window"
            );
        } else {
            trace!(
                key = %key,
                used = usage.quota_used,
                delta = usage_delta,
                "Recorded quota usage"
            );
        }

        self.cache.insert(key, usage.clone());
        Ok(usage)
    }

    /// Current window's row. `None` means nothing was recorded this window.
    pub async fn get_quota_usage(
        &self,
        api_provider: &str,
        quota_type: QuotaType,
    ) -> Result<Option<QuotaUsage>> {
        let key = self.current_key(api_provider, quota_type);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Some(cached));
        }

        let usage = self.store.get(&key).await?;
        if let Some(ref usage) = usage {
            self.cache.insert(key, usage.clone());
        }
        Ok(usage)
    }

    /// Whether the current window is flagged and the flag has not yet expired.
    pub async fn is_rate_limited(&self, api_provider: &str, quota_type: QuotaType) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .get_quota_usage(api_provider, quota_type)
            .await?
            .map_or(false, |usage| usage.is_limited_at(now)))
    }

    /// Quota left in the current window; `nominal_limit` when nothing was recorded.
    pub async fn get_remaining_quota(
        &self,
        api_provider: &str,
        quota_type: QuotaType,
        nominal_limit: u64,
    ) -> Result<u64> {
        Ok(match self.get_quota_usage(api_provider, quota_type).await? {
            Some(usage) => usage.quota_limit.saturating_sub(usage.quota_used),
            None => nominal_limit,
        })
    }

    /// Zero a window's usage and clear its flag. Defaults to the current window.
    ///
    /// Returns `false` when the window has no row.
    pub async fn reset_quota(
        &self,
        api_provider: &str,
        quota_type: QuotaType,
        window: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let key = QuotaKey::new(api_provider, quota_type, window.unwrap_or(now));
        self.cache.invalidate(&key);

        let Some(mut usage) = self.store.get(&key).await? else {
            return Ok(false);
        };

        usage.quota_used = 0;
        usage.quota_remaining = usage.quota_limit;
        usage.is_rate_limited = false;
        usage.rate_limit_reset_at = None;
        usage.updated_at = now;
        self.store.upsert(usage).await?;

        info!(key = %key, "Quota reset");
        Ok(true)
    }

    /// Totals over the trailing `hours`.
    pub async fn get_quota_statistics(
        &self,
        api_provider: &str,
        hours: u32,
    ) -> Result<QuotaStatistics> {
        let since = minute_floor(self.clock.now() - chrono::Duration::hours(i64::from(hours)));
        let rows = self.store.scan(api_provider, since).await?;

        let mut stats = QuotaStatistics {
            api_provider: api_provider.to_string(),
            hours,
            ..Default::default()
        };
        let mut windows = std::collections::BTreeMap::<DateTime<Utc>, bool>::new();

        for row in &rows {
            match row.quota_type {
                QuotaType::Requests => stats.total_requests += row.quota_used,
                QuotaType::Tokens => stats.total_tokens += row.quota_used,
            }
            let limited = windows.entry(row.time_window).or_insert(false);
            *limited |= row.is_rate_limited;
        }

        stats.window_count = windows.len() as u64;
        stats.rate_limited_windows = windows.values().filter(|limited| **limited).count() as u64;
        if stats.window_count > 0 {
            let windows = stats.window_count as f64;
            stats.average_requests_per_window = stats.total_requests as f64 / windows;
            stats.average_tokens_per_window = stats.total_tokens as f64 / windows;
        }
        Ok(stats)
    }

    /// Delete rows older than `days_to_keep` days. Returns the number deleted.
    pub async fn cleanup_old_records(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(days_to_keep));
        let deleted = self.store.delete_older_than(cutoff).await?;
        self.cache.purge_expired();
        info!(deleted, days_to_keep, "Cleaned up old quota records");
        Ok(deleted)
    }

    /// Run [`cleanup_old_records`](Self::cleanup_old_records) every `interval` until aborted.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        days_to_keep: u32,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = service.cleanup_old_records(days_to_keep).await {
                    warn!(error = %e, "Quota cleanup failed");
                }
            }
        })
    }
}
