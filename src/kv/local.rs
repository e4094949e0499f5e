use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Kv;
use crate::error::Result;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

/// In-memory fallback used when the shared KV is unreachable: plain
/// mutex-guarded maps with lazy expiry checked on access, plus a periodic
/// sweeper.
#[derive(Clone)]
pub struct LocalKv {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Default for LocalKv {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalKv {
    pub fn new() -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn spawn_sweeper(&self, interval: Duration) {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut guard = entries.lock().await;
                guard.retain(|_, e| !e.is_expired());
            }
        });
    }
}

#[async_trait]
impl Kv for LocalKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key) {
            if !existing.is_expired() {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) });
        Ok(true)
    }

    async fn compare_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(e) if !e.is_expired() && e.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(e) if !e.is_expired() && e.value == expected => {
                e.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).filter(|e| !e.is_expired()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at: ttl.map(|d| Instant::now() + d) });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let count = match entries.get(key) {
            Some(e) if !e.is_expired() => e.value.parse::<i64>().unwrap_or(0) + 1,
            _ => 1,
        };
        let expires_at = match entries.get(key) {
            Some(e) if !e.is_expired() => e.expires_at,
            _ => Some(Instant::now() + ttl),
        };
        entries.insert(key.to_string(), Entry { value: count.to_string(), expires_at });
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_succeeds_once() {
        let kv = LocalKv::new();
        assert!(kv.set_nx("k", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.set_nx("k", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn compare_delete_requires_matching_token() {
        let kv = LocalKv::new();
        kv.set_nx("lock", "tok1", Duration::from_secs(5)).await.unwrap();
        assert!(!kv.compare_delete("lock", "tok2").await.unwrap());
        assert!(kv.compare_delete("lock", "tok1").await.unwrap());
    }

    #[tokio::test]
    async fn incr_with_ttl_accumulates() {
        let kv = LocalKv::new();
        assert_eq!(kv.incr_with_ttl("c", Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(kv.incr_with_ttl("c", Duration::from_secs(1)).await.unwrap(), 2);
    }
}
