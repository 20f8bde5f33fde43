//! Short-lived cache for serialized query results.
//!
//! Values are stored as JSON bytes so one cache can hold every response type.
//! Expiry is handled by a Moka cache with a fixed time-to-live, so an expired
//! entry is never returned. A background task runs Moka's pending maintenance
//! once per TTL until [`TtlCache::shutdown`] is called or the cache is dropped.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

pub struct TtlCache {
    entries: Cache<String, Arc<Vec<u8>>>,
    ttl: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl TtlCache {
    /// Create a cache and start its sweep task. Must be called inside a Tokio runtime.
    pub fn new(ttl: Duration) -> Self {
        let entries: Cache<String, Arc<Vec<u8>>> = Cache::builder()
            .time_to_live(ttl.max(Duration::from_millis(1)))
            .build();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let sweep_entries = entries.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(ttl.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sweep_entries.run_pending_tasks();
                        tracing::debug!(
                            entries = sweep_entries.entry_count(),
                            "Swept expired cache entries"
                        );
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::debug!("Cache sweep task stopped");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            entries,
            ttl,
            shutdown_tx,
        }
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// Values that fail to serialize are skipped; caching is best-effort.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_vec(value) {
            Ok(data) => self.entries.insert(key.to_string(), Arc::new(data)),
            Err(e) => tracing::warn!("Failed to serialize cache entry {}: {}", key, e),
        }
    }

    /// Fetch a live entry. Missing, expired, and undecodable entries all miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.entries.get(key)?;
        serde_json::from_slice(&data).ok()
    }

    /// Evict expired entries now
    pub fn sweep(&self) {
        self.entries.run_pending_tasks();
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of live entries after pending maintenance has run
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the sweep task
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        pageviews: i64,
        label: String,
    }

    fn sample() -> Sample {
        Sample {
            pageviews: 42,
            label: "home".to_string(),
        }
    }

    #[tokio::test]
    async fn test_get_returns_fresh_entry() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.set("overview:example.com:7d", &sample());

        let hit: Option<Sample> = cache.get("overview:example.com:7d");
        assert_eq!(hit, Some(sample()));
        assert_eq!(cache.get::<Sample>("overview:other.com:7d"), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_returned() {
        let cache = TtlCache::new(Duration::from_millis(200));
        cache.shutdown();
        cache.set("k", &sample());

        assert!(cache.get::<Sample>("k").is_some());

        // No maintenance has run; expiry alone hides the entry
        time::sleep(Duration::from_millis(350)).await;
        assert!(cache.get::<Sample>("k").is_none());
    }

    #[tokio::test]
    async fn test_set_replaces_and_refreshes_expiry() {
        let cache = TtlCache::new(Duration::from_millis(400));
        cache.set("k", &1_i64);
        time::sleep(Duration::from_millis(250)).await;
        cache.set("k", &2_i64);
        time::sleep(Duration::from_millis(250)).await;

        assert_eq!(cache.get::<i64>("k"), Some(2));
    }

    #[tokio::test]
    async fn test_type_mismatch_is_a_miss() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.set("k", &"not a sample");
        assert_eq!(cache.get::<Sample>("k"), None);
    }

    #[tokio::test]
    async fn test_manual_sweep() {
        let cache = TtlCache::new(Duration::from_millis(200));
        cache.shutdown();

        cache.set("a", &1_i64);
        cache.set("b", &2_i64);
        assert_eq!(cache.len(), 2);

        time::sleep(Duration::from_millis(350)).await;
        cache.set("c", &3_i64);
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<i64>("c"), Some(3));
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired_entries() {
        let cache = TtlCache::new(Duration::from_millis(100));
        cache.set("a", &1_i64);
        cache.entries.run_pending_tasks();
        assert_eq!(cache.entries.entry_count(), 1);

        time::sleep(Duration::from_millis(450)).await;
        assert_eq!(cache.entries.entry_count(), 0);
    }
}
