//! Process-local cache for hosts without a writable disk.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::{unix_now, CacheEntry, CacheError, CacheStats, ResponseCache};

/// In-memory cache with lazy expiration.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    default_ttl: Option<Duration>,
}

impl InMemoryCache {
    /// Creates an empty cache whose entries never expire by default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the TTL applied when `set` is called without one.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Returns the number of stored entries, live or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ResponseCache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let entry = CacheEntry::new(key, value, ttl.or(self.default_ttl));
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn clear(&self, key: Option<&str>) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        match key {
            Some(key) => {
                entries.remove(key);
            }
            None => entries.clear(),
        }
        Ok(())
    }

    async fn get_stats(&self) -> Result<CacheStats, CacheError> {
        let now = unix_now();
        let mut entries = self.entries.lock();
        let mut stats = CacheStats {
            total_entries: entries.len(),
            ..CacheStats::default()
        };
        entries.retain(|_, entry| {
            if entry.is_live_at(now) {
                stats.active_entries += 1;
                stats.size_bytes += entry.value.to_string().len() as u64;
                true
            } else {
                stats.expired_entries += 1;
                false
            }
        });
        Ok(stats)
    }
}
