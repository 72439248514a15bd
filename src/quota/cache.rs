//! Short-lived read cache in front of the ledger.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::SharedClock;

struct Entry<V> {
    value: V,
    expires_at_ms: i64,
}

/// Map whose entries expire a fixed time after they were written.
///
/// Expired entries are dropped lazily on read and by [`TtlCache::purge_expired`].
pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
    clock: SharedClock,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at_ms <= now);
        }
        None
    }

    /// Store `value` for one TTL.
    pub fn insert(&self, key: K, value: V) {
        let expires_at_ms = self.clock.now_millis() + self.ttl.as_millis() as i64;
        self.entries.insert(key, Entry { value, expires_at_ms });
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms > now);
        before.saturating_sub(self.entries.len())
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn cache(ttl_ms: u64) -> (TtlCache<String, u64>, ManualClock) {
        let clock = ManualClock::at_millis(0);
        (
            TtlCache::new(Duration::from_millis(ttl_ms), Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_get_before_and_after_expiry() {
        let (cache, clock) = cache(30_000);
        cache.insert("a".to_string(), 1);

        clock.advance_millis(29_999);
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        clock.advance_millis(1);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_refreshes_ttl() {
        let (cache, clock) = cache(1_000);
        cache.insert("a".to_string(), 1);
        clock.advance_millis(900);
        cache.insert("a".to_string(), 2);
        clock.advance_millis(900);

        assert_eq!(cache.get(&"a".to_string()), Some(2));
    }

    #[test]
    fn test_invalidate_and_purge() {
        let (cache, clock) = cache(1_000);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.len(), 1);

        clock.advance_millis(1_000);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }
}
