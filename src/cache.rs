//! TTL cache in front of the API key table.
//!
//! Stores either the key's request budget or a negative entry for keys the
//! database does not consider effective. Admin writes and payment
//! activations invalidate the specific entry so a fresh key never waits out
//! a stale negative.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::KeyLimits;
use crate::time_source::TimeSource;

pub const KEY_CACHE_TTL: Duration = Duration::from_secs(60);
pub const KEY_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct Entry {
    /// None is a negative entry: the key was looked up and is not effective.
    limits: Option<KeyLimits>,
    inserted_nanos: u64,
}

/// Outcome of a cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Entry present and fresh; None means "known not effective".
    Hit(Option<KeyLimits>),
    Miss,
}

pub struct KeyCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    time: Arc<dyn TimeSource>,
}

impl KeyCache {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: KEY_CACHE_TTL,
            time,
        }
    }

    pub async fn lookup(&self, api_key: &str) -> CacheLookup {
        let now = self.time.monotonic_nanos();
        let entries = self.entries.lock().await;
        match entries.get(api_key) {
            Some(entry) if !self.is_expired(entry, now) => {
                CacheLookup::Hit(entry.limits)
            }
            _ => CacheLookup::Miss,
        }
    }

    pub async fn insert(&self, api_key: &str, limits: Option<KeyLimits>) {
        let now = self.time.monotonic_nanos();
        let mut entries = self.entries.lock().await;
        entries.insert(
            api_key.to_string(),
            Entry {
                limits,
                inserted_nanos: now,
            },
        );
    }

    /// Drop the entry for one key. Called on every admin mutation and on
    /// payment activation so the next lookup hits the database.
    pub async fn invalidate(&self, api_key: &str) {
        let mut entries = self.entries.lock().await;
        if entries.remove(api_key).is_some() {
            debug!(api_key_suffix = suffix(api_key), "Key cache entry invalidated");
        }
    }

    /// Remove expired entries; returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = self.time.monotonic_nanos();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        before - entries.len()
    }

    fn is_expired(&self, entry: &Entry, now_nanos: u64) -> bool {
        now_nanos.saturating_sub(entry.inserted_nanos) >= self.ttl.as_nanos() as u64
    }
}

/// Last few characters of a key, safe to log.
fn suffix(api_key: &str) -> &str {
    let len = api_key.len();
    &api_key[len.saturating_sub(4)..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::ManualTimeSource;

    fn limits() -> KeyLimits {
        KeyLimits {
            requests_per_second: 5,
            requests_per_day: 1000,
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let time = Arc::new(ManualTimeSource::new());
        let cache = KeyCache::new(time);

        assert_eq!(cache.lookup("sk_a").await, CacheLookup::Miss);
        cache.insert("sk_a", Some(limits())).await;
        assert_eq!(cache.lookup("sk_a").await, CacheLookup::Hit(Some(limits())));
    }

    #[tokio::test]
    async fn negative_entry_is_a_hit() {
        let time = Arc::new(ManualTimeSource::new());
        let cache = KeyCache::new(time);

        cache.insert("sk_unknown", None).await;
        assert_eq!(cache.lookup("sk_unknown").await, CacheLookup::Hit(None));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let time = Arc::new(ManualTimeSource::new());
        let cache = KeyCache::new(time.clone());

        cache.insert("sk_a", Some(limits())).await;
        time.advance_secs(59);
        assert_eq!(cache.lookup("sk_a").await, CacheLookup::Hit(Some(limits())));

        time.advance_secs(2);
        assert_eq!(cache.lookup("sk_a").await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn invalidate_removes_entry_immediately() {
        let time = Arc::new(ManualTimeSource::new());
        let cache = KeyCache::new(time);

        cache.insert("sk_a", None).await;
        cache.invalidate("sk_a").await;
        assert_eq!(cache.lookup("sk_a").await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired() {
        let time = Arc::new(ManualTimeSource::new());
        let cache = KeyCache::new(time.clone());

        cache.insert("sk_old", Some(limits())).await;
        time.advance_secs(61);
        cache.insert("sk_new", Some(limits())).await;

        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.lookup("sk_new").await, CacheLookup::Hit(Some(limits())));
    }
}
