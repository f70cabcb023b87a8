//! Settings cache.
//!
//! Thread-safe TTL cache of raw setting text keyed by setting key. Absent
//! keys are cached too, so repeated lookups of unset keys stay off the database.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default TTL for cached settings.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct CacheEntry {
    value: Option<String>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Thread-safe TTL cache for stored setting values.
#[derive(Clone)]
pub struct SettingsCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Cached stored text for `key`.
    ///
    /// `None` means "not cached"; `Some(None)` means "cached as unset".
    pub fn get(&self, key: &str) -> Option<Option<String>> {
        let entry = self.entries.get(key)?;

        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }

        Some(entry.value.clone())
    }

    pub fn insert(&self, key: &str, value: Option<String>) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SettingsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_distinguishes_unset_from_missing() {
        let cache = SettingsCache::new();
        assert_eq!(cache.get("ai.ai_enabled"), None);

        cache.insert("ai.ai_enabled", None);
        assert_eq!(cache.get("ai.ai_enabled"), Some(None));

        cache.insert("ai.ai_enabled", Some("true".into()));
        assert_eq!(cache.get("ai.ai_enabled"), Some(Some("true".into())));

        cache.invalidate("ai.ai_enabled");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_are_evicted() {
        let cache = SettingsCache::with_ttl(Duration::ZERO);
        cache.insert("k", Some("1".into()));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }
}
