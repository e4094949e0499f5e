use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

struct CacheEntry {
    data: Value,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// TTL + bounded-entry cache in front of the conversation store, keyed by
/// the semantic keys the conversation and ban lookups need (ban status,
/// active topic, rendered topic name).
#[derive(Clone)]
pub struct Cache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    stats: Arc<RwLock<CacheStats>>,
    max_entries: usize,
}

impl Cache {
    pub fn new(max_entries: usize) -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), stats: Arc::new(RwLock::new(CacheStats::default())), max_entries }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.write().await;
        let mut stats = self.stats.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.access_count += 1;
                entry.last_accessed = Instant::now();
                stats.hits += 1;
                Some(entry.data.clone())
            }
            Some(_) => {
                entries.remove(key);
                stats.misses += 1;
                None
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            self.evict_lru_locked(&mut entries).await;
        }
        entries.insert(
            key.to_string(),
            CacheEntry { data: value, created_at: Instant::now(), ttl, access_count: 0, last_accessed: Instant::now() },
        );
    }

    pub async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Invalidates both the entity-keyed and topic-keyed cache entries for a
    /// conversation, as every mutating store write must.
    pub async fn invalidate_conversation(&self, entity_type: &str, entity_id: i64, topic_id: Option<i64>) {
        self.remove(&format!("conv_entity:{entity_type}:{entity_id}")).await;
        if let Some(topic_id) = topic_id {
            self.remove(&format!("conv_topic:{topic_id}")).await;
        }
    }

    async fn evict_lru_locked(&self, entries: &mut HashMap<String, CacheEntry>) {
        if let Some((oldest_key, _)) = entries.iter().min_by_key(|(_, e)| e.last_accessed).map(|(k, v)| (k.clone(), v.last_accessed)) {
            entries.remove(&oldest_key);
            self.stats.write().await.evictions += 1;
            debug!(key = oldest_key, "evicted cache entry under pressure");
        }
    }

    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        before - entries.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = cache.cleanup_expired().await;
                if purged > 0 {
                    debug!(purged, "cache sweeper purged expired entries");
                }
            }
        });
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }
}

/// Ban-cache TTL: 60s when not banned, 300s when banned, so a lifted ban
/// clears quickly but an active one doesn't need rechecking every message.
pub fn ban_cache_ttl(is_banned: bool) -> Duration {
    if is_banned {
        Duration::from_secs(300)
    } else {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_after_set_hits() {
        let cache = Cache::new(10);
        cache.set("k", json!({"a": 1}), Duration::from_secs(5)).await;
        assert_eq!(cache.get("k").await, Some(json!({"a": 1})));
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn expired_entry_counts_as_miss() {
        let cache = Cache::new(10);
        cache.set("k", json!(1), Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn eviction_under_pressure_removes_lru() {
        let cache = Cache::new(1);
        cache.set("old", json!(1), Duration::from_secs(60)).await;
        cache.set("new", json!(2), Duration::from_secs(60)).await;
        assert_eq!(cache.get("old").await, None);
        assert_eq!(cache.get("new").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn invalidate_conversation_clears_both_keys() {
        let cache = Cache::new(10);
        cache.set("conv_entity:user:1", json!(1), Duration::from_secs(60)).await;
        cache.set("conv_topic:42", json!(1), Duration::from_secs(60)).await;
        cache.invalidate_conversation("user", 1, Some(42)).await;
        assert_eq!(cache.get("conv_entity:user:1").await, None);
        assert_eq!(cache.get("conv_topic:42").await, None);
    }
}
