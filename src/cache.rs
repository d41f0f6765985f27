//! Process-wide TTL cache with single-flight memoization.
//!
//! One `MemoryCache` instance lives for the whole process (see `CACHE`);
//! provider clients go through `cache_get_or_fetch` so that concurrent misses
//! on the same key share a single upstream fetch. Cache problems never
//! propagate: a serialization failure falls through to a direct fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

lazy_static! {
    pub static ref CACHE: MemoryCache = MemoryCache::new();
}

/// TTL per data category, in seconds.
pub fn ttl_for(category: &str) -> Duration {
    let secs = match category {
        "quote" => 15,
        "quote_after_hours" => 300,
        "price_history" => 3600,
        "analyst_ratings" => 86_400,
        "sec_filings" => 86_400,
        "reddit_sentiment" => 300,
        "economic_data" => 3600,
        "news" => 300,
        "insider_trades" => 3600,
        _ => 60,
    };
    Duration::from_secs(secs)
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    // Per-key guards so that only one fetch runs per key at a time.
    in_flight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                if entry.expires_at > Instant::now() {
                    return Some(entry.value.clone());
                }
            } else {
                return None;
            }
        }
        // Expired: drop lazily on read.
        self.entries.write().remove(key);
        None
    }

    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key.to_string(), entry);
    }

    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    async fn flight_guard(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.in_flight.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn release_flight(&self, key: &str, guard: &Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.in_flight.lock().await;
        // Only the last holder removes the slot.
        if Arc::strong_count(guard) <= 2 {
            map.remove(key);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Return the cached value for `key`, or run `fetch` (at most once across
/// concurrent callers), cache a non-`None` result under the category TTL, and
/// return it.
pub async fn cache_get_or_fetch<T, F, Fut>(key: &str, ttl_type: &str, fetch: F) -> Option<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    if let Some(raw) = CACHE.get(key) {
        match serde_json::from_value::<T>(raw) {
            Ok(v) => return Some(v),
            Err(e) => {
                // Stored shape drifted; evict and refetch.
                warn!(key, error = %e, "cache entry failed to decode, evicting");
                CACHE.delete(key);
            }
        }
    }

    let guard = CACHE.flight_guard(key).await;
    let _held = guard.lock().await;

    // A concurrent flight may have filled the slot while we waited.
    if let Some(raw) = CACHE.get(key) {
        if let Ok(v) = serde_json::from_value::<T>(raw) {
            CACHE.release_flight(key, &guard).await;
            return Some(v);
        }
    }

    let result = fetch().await;
    if let Some(ref value) = result {
        match serde_json::to_value(value) {
            Ok(raw) => CACHE.set(key, raw, ttl_for(ttl_type)),
            Err(e) => debug!(key, error = %e, "skipping cache store, value not serializable"),
        }
    }
    CACHE.release_flight(key, &guard).await;
    result
}

pub fn init_cache() {
    CACHE.clear();
    info!("In-memory TTL cache initialised");
}

pub fn close_cache() {
    let dropped = CACHE.len() as u64;
    CACHE.clear();
    info!(dropped, "In-memory TTL cache closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ttl_table_matches_categories() {
        assert_eq!(ttl_for("quote"), Duration::from_secs(15));
        assert_eq!(ttl_for("quote_after_hours"), Duration::from_secs(300));
        assert_eq!(ttl_for("price_history"), Duration::from_secs(3600));
        assert_eq!(ttl_for("analyst_ratings"), Duration::from_secs(86_400));
        assert_eq!(ttl_for("reddit_sentiment"), Duration::from_secs(300));
        assert_eq!(ttl_for("economic_data"), Duration::from_secs(3600));
        assert_eq!(ttl_for("news"), Duration::from_secs(300));
        assert_eq!(ttl_for("insider_trades"), Duration::from_secs(3600));
        assert_eq!(ttl_for("anything_else"), Duration::from_secs(60));
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let cache = MemoryCache::new();
        cache.set("k", serde_json::json!({"a": 1}), Duration::from_secs(60));
        assert_eq!(cache.get("k").unwrap()["a"], 1);
        cache.delete("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = MemoryCache::new();
        cache.set("k", serde_json::json!(1), Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn get_or_fetch_caches_value() {
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            let got: Option<u32> = cache_get_or_fetch(&key, "default", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(7)
            })
            .await;
            assert_eq!(got, Some(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_fetch_does_not_cache_none() {
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            let got: Option<u32> = cache_get_or_fetch(&key, "default", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                None
            })
            .await;
            assert_eq!(got, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_get_or_fetch_runs_fetch_once() {
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let got: Option<u32> = cache_get_or_fetch(&key, "default", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Some(42)
                })
                .await;
                got
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
