//! Short-lived read cache for browse queries. Never consulted on a write path.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::clock::Clock;

pub struct TtlCache<V> {
    entries: DashMap<String, (DateTime<Utc>, V)>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
            clock,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.0 > now)
            .map(|entry| entry.1.clone());
        match &hit {
            Some(_) => tracing::trace!(key, "cache hit"),
            None => tracing::trace!(key, "cache miss"),
        }
        hit
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries.insert(key.into(), (expires_at, value));
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, (expires_at, _)| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

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
    use crate::model::fixtures::at;

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(at(2025, 6, 1, 9, 0)));
        let cache = TtlCache::new(std::time::Duration::from_secs(300), clock.clone());
        cache.insert("rust", vec![1, 2]);
        assert_eq!(cache.get("rust"), Some(vec![1, 2]));

        clock.advance(Duration::seconds(299));
        assert!(cache.get("rust").is_some());
        clock.advance(Duration::seconds(1));
        assert!(cache.get("rust").is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_clears_everything() {
        let clock = Arc::new(ManualClock::new(at(2025, 6, 1, 9, 0)));
        let cache = TtlCache::new(std::time::Duration::from_secs(60), clock);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.invalidate_all();
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 0);
    }
}
