//! Durable quota ledger storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::key::{QuotaKey, QuotaType};
use crate::error::Result;

/// One ledger row, shaped like the `api_quota_tracking` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub api_provider: String,
    pub quota_type: QuotaType,
    pub time_window: DateTime<Utc>,
    pub quota_used: u64,
    pub quota_limit: u64,
    pub quota_remaining: u64,
    pub is_rate_limited: bool,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaUsage {
    /// An empty row for `key`.
    pub fn empty(key: &QuotaKey, quota_limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            api_provider: key.api_provider.clone(),
            quota_type: key.quota_type,
            time_window: key.time_window,
            quota_used: 0,
            quota_limit,
            quota_remaining: quota_limit,
            is_rate_limited: false,
            rate_limit_reset_at: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> QuotaKey {
        QuotaKey {
            api_provider: self.api_provider.clone(),
            quota_type: self.quota_type,
            time_window: self.time_window,
        }
    }

    /// The rate-limited flag, ignoring flags whose reset time has passed.
    pub fn is_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.is_rate_limited && self.rate_limit_reset_at.map_or(true, |reset| reset > now)
    }
}

/// Keyed row store backing the ledger.
///
/// Implementations are shared by every worker and process using one provider
/// account. Writes are last-writer-wins per row.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Fetch one row.
    async fn get(&self, key: &QuotaKey) -> Result<Option<QuotaUsage>>;

    /// Insert or replace the row identified by `usage.key()`.
    async fn upsert(&self, usage: QuotaUsage) -> Result<()>;

    /// Delete every row whose window starts before `cutoff`. Returns the number deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Every row for `api_provider` whose window starts at or after `since`, oldest first.
    async fn scan(&self, api_provider: &str, since: DateTime<Utc>) -> Result<Vec<QuotaUsage>>;
}

/// Process-local [`QuotaStore`] for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    rows: DashMap<QuotaKey, QuotaUsage>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get(&self, key: &QuotaKey) -> Result<Option<QuotaUsage>> {
        Ok(self.rows.get(key).map(|row| row.value().clone()))
    }

    async fn upsert(&self, usage: QuotaUsage) -> Result<()> {
        self.rows.insert(usage.key(), usage);
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.rows.len();
        self.rows.retain(|key, _| key.time_window >= cutoff);
        Ok(before.saturating_sub(self.rows.len()) as u64)
    }

    async fn scan(&self, api_provider: &str, since: DateTime<Utc>) -> Result<Vec<QuotaUsage>> {
        let mut rows: Vec<QuotaUsage> = self
            .rows
            .iter()
            .filter(|row| row.key().api_provider == api_provider && row.key().time_window >= since)
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by_key(|row| (row.time_window, row.quota_type.as_str()));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap()
    }

    fn row(provider: &str, quota_type: QuotaType, minute: u32, used: u64) -> QuotaUsage {
        let key = QuotaKey::new(provider, quota_type, at(minute));
        let mut usage = QuotaUsage::empty(&key, 100, at(minute));
        usage.quota_used = used;
        usage.quota_remaining = 100 - used;
        usage
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = InMemoryQuotaStore::new();
        let usage = row("gemini", QuotaType::Requests, 1, 5);
        store.upsert(usage.clone()).await.unwrap();

        let fetched = store.get(&usage.key()).await.unwrap();
        assert_eq!(fetched, Some(usage));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let store = InMemoryQuotaStore::new();
        store.upsert(row("gemini", QuotaType::Requests, 1, 5)).await.unwrap();
        store.upsert(row("gemini", QuotaType::Requests, 1, 9)).await.unwrap();

        let key = QuotaKey::new("gemini", QuotaType::Requests, at(1));
        assert_eq!(store.get(&key).await.unwrap().unwrap().quota_used, 9);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = InMemoryQuotaStore::new();
        for minute in 0..5 {
            store.upsert(row("gemini", QuotaType::Tokens, minute, 1)).await.unwrap();
        }

        let deleted = store.delete_older_than(at(3)).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_filters_provider_and_horizon() {
        let store = InMemoryQuotaStore::new();
        store.upsert(row("gemini", QuotaType::Requests, 1, 1)).await.unwrap();
        store.upsert(row("gemini", QuotaType::Requests, 5, 2)).await.unwrap();
        store.upsert(row("gemini", QuotaType::Tokens, 5, 3)).await.unwrap();
        store.upsert(row("openai", QuotaType::Requests, 5, 4)).await.unwrap();

        let rows = store.scan("gemini", at(2)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.api_provider == "gemini" && r.time_window == at(5)));
    }

    #[test]
    fn test_stale_flag_is_not_limiting() {
        let mut usage = row("gemini", QuotaType::Requests, 1, 100);
        usage.is_rate_limited = true;
        usage.rate_limit_reset_at = Some(at(2));

        assert!(usage.is_limited_at(at(1)));
        assert!(!usage.is_limited_at(at(2)));
        assert!(!usage.is_limited_at(at(2) + Duration::seconds(1)));

        usage.rate_limit_reset_at = None;
        assert!(usage.is_limited_at(at(30)));
    }
}
