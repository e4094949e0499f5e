mod local;
mod redis_backend;

pub use local::LocalKv;
pub use redis_backend::RedisKv;

use async_trait::async_trait;

use crate::error::Result;

/// A shared key-value + distributed lock primitive. Implementations must make
/// `set_nx` and `compare_delete` atomic so two processes racing on the same
/// key converge on one winner. When the shared backend is unreachable the
/// caller is expected to fall back to `LocalKv` and keep serving degraded.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Set `key` to `value` with a TTL, only if it does not already exist.
    /// Returns true if the write happened (lock acquired).
    async fn set_nx(&self, key: &str, value: &str, ttl: std::time::Duration) -> Result<bool>;

    /// Delete `key` only if its current value equals `expected` (lock release
    /// by the owning token). Returns true if deleted.
    async fn compare_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Re-arm the TTL on `key`, conditional on its value equalling `expected`.
    async fn extend(&self, key: &str, expected: &str, ttl: std::time::Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<std::time::Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomic increment used by fixed-window rate limiting; returns the new
    /// count. Sets `ttl` the first time the key is created.
    async fn incr_with_ttl(&self, key: &str, ttl: std::time::Duration) -> Result<i64>;
}

/// A handle returned by `acquire_lock`, released on `Drop` via a best-effort
/// spawned compare-delete (the caller can also `release` explicitly to
/// observe failures).
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

pub async fn acquire_lock(kv: &dyn Kv, key: &str, ttl: std::time::Duration) -> Result<Option<LockGuard>> {
    let token = uuid::Uuid::new_v4().to_string();
    if kv.set_nx(key, &token, ttl).await? {
        Ok(Some(LockGuard { key: key.to_string(), token }))
    } else {
        Ok(None)
    }
}

pub async fn release_lock(kv: &dyn Kv, guard: LockGuard) -> Result<bool> {
    kv.compare_delete(&guard.key, &guard.token).await
}
