use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::RwLock;
use tracing::warn;

use super::rules::{LimitType, RateLimitRule};
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone)]
pub struct LimitDecision {
    pub allowed: bool,
    pub current_count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: f64,
    pub retry_after: Option<u64>,
    pub punishment_ends_at: Option<f64>,
}

/// Backend that actually performs the atomic admission check for one rule,
/// split between a Redis-scripted implementation and an in-memory fallback.
#[async_trait]
trait LimitBackend: Send + Sync {
    async fn check(&self, rule: &RateLimitRule, identifier: &str, weight: u32) -> Result<LimitDecision>;
    async fn punishment_end(&self, rule: &RateLimitRule, identifier: &str) -> Result<Option<f64>>;
    async fn apply_punishment(&self, rule: &RateLimitRule, identifier: &str) -> Result<()>;
    async fn is_whitelisted(&self, identifier: &str) -> Result<bool>;
}

struct RedisBackend {
    connection: Arc<tokio::sync::Mutex<ConnectionManager>>,
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local weight = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count + weight <= limit then
    for i = 1, weight do
        redis.call('ZADD', key, now, now .. ':' .. i .. ':' .. math.random())
    end
    allowed = 1
    count = count + weight
end
redis.call('EXPIRE', key, window + 1)
return {allowed, count}
"#;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local weight = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or capacity
local last_refill = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= weight then
    tokens = tokens - weight
    allowed = 1
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('EXPIRE', key, 3600)
return {allowed, tokens}
"#;

#[async_trait]
impl LimitBackend for RedisBackend {
    async fn check(&self, rule: &RateLimitRule, identifier: &str, weight: u32) -> Result<LimitDecision> {
        let now = now_secs();
        let limit = rule.max_requests + rule.burst_allowance;
        let mut conn = self.connection.lock().await;

        let (allowed, count): (i64, f64) = match rule.limit_type {
            LimitType::SlidingWindow => {
                let key = format!("{}:sliding:{}", rule.key_prefix(), identifier);
                Script::new(SLIDING_WINDOW_SCRIPT)
                    .key(key)
                    .arg(now)
                    .arg(rule.window_seconds as f64)
                    .arg(limit)
                    .arg(weight)
                    .invoke_async(&mut *conn)
                    .await
                    .map_err(|e| BridgeError::Kv(e.to_string()))?
            }
            LimitType::TokenBucket => {
                let key = format!("{}:bucket:{}", rule.key_prefix(), identifier);
                let refill_rate = rule.max_requests as f64 / rule.window_seconds.max(1) as f64;
                Script::new(TOKEN_BUCKET_SCRIPT)
                    .key(key)
                    .arg(now)
                    .arg(limit as f64)
                    .arg(refill_rate)
                    .arg(weight)
                    .invoke_async(&mut *conn)
                    .await
                    .map_err(|e| BridgeError::Kv(e.to_string()))?
            }
            LimitType::FixedWindow => {
                let window_index = (now / rule.window_seconds as f64).floor() as i64;
                let key = format!("{}:fixed:{}:{}", rule.key_prefix(), identifier, window_index);
                let count: i64 = conn.incr(&key, weight).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
                let _: () = conn
                    .expire(&key, rule.window_seconds as i64)
                    .await
                    .map_err(|e| BridgeError::Kv(e.to_string()))?;
                let allowed = if count as u32 <= limit { 1 } else { 0 };
                (allowed, count as f64)
            }
        };

        Ok(LimitDecision {
            allowed: allowed == 1,
            current_count: count as u32,
            limit,
            remaining: limit.saturating_sub(count as u32),
            reset_time: now + rule.window_seconds as f64,
            retry_after: None,
            punishment_ends_at: None,
        })
    }

    async fn punishment_end(&self, rule: &RateLimitRule, identifier: &str) -> Result<Option<f64>> {
        let key = format!("{}:punishment:{}", rule.key_prefix(), identifier);
        let mut conn = self.connection.lock().await;
        let value: Option<String> = conn.get(&key).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
        Ok(value.and_then(|v| v.parse::<f64>().ok()))
    }

    async fn apply_punishment(&self, rule: &RateLimitRule, identifier: &str) -> Result<()> {
        let key = format!("{}:punishment:{}", rule.key_prefix(), identifier);
        let ends_at = now_secs() + rule.punishment_duration_secs as f64;
        let mut conn = self.connection.lock().await;
        let _: () = conn
            .set_ex(&key, ends_at.to_string(), rule.punishment_duration_secs)
            .await
            .map_err(|e| BridgeError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn is_whitelisted(&self, identifier: &str) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let exists: bool = conn.exists(format!("ratelimit:whitelist:{identifier}")).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
        Ok(exists)
    }
}

struct MemoryBucket {
    tokens: f64,
    last_refill: f64,
}

struct MemoryBackend {
    sliding: RwLock<HashMap<String, Vec<f64>>>,
    buckets: RwLock<HashMap<String, MemoryBucket>>,
    fixed: RwLock<HashMap<String, (i64, u32)>>,
    punishments: RwLock<HashMap<String, f64>>,
    whitelist: RwLock<HashMap<String, Option<f64>>>,
}

impl MemoryBackend {
    fn new() -> Self {
        Self {
            sliding: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            fixed: RwLock::new(HashMap::new()),
            punishments: RwLock::new(HashMap::new()),
            whitelist: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LimitBackend for MemoryBackend {
    async fn check(&self, rule: &RateLimitRule, identifier: &str, weight: u32) -> Result<LimitDecision> {
        let now = now_secs();
        let limit = rule.max_requests + rule.burst_allowance;

        let (allowed, count) = match rule.limit_type {
            LimitType::SlidingWindow => {
                let key = format!("{}:{}", rule.name, identifier);
                let mut sliding = self.sliding.write().await;
                let entries = sliding.entry(key).or_default();
                entries.retain(|&t| t > now - rule.window_seconds as f64);
                let allowed = entries.len() as u32 + weight <= limit;
                if allowed {
                    for _ in 0..weight {
                        entries.push(now);
                    }
                }
                (allowed, entries.len() as u32)
            }
            LimitType::TokenBucket => {
                let key = format!("{}:{}", rule.name, identifier);
                let refill_rate = rule.max_requests as f64 / rule.window_seconds.max(1) as f64;
                let mut buckets = self.buckets.write().await;
                let bucket = buckets.entry(key).or_insert(MemoryBucket { tokens: limit as f64, last_refill: now });
                let elapsed = (now - bucket.last_refill).max(0.0);
                bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(limit as f64);
                bucket.last_refill = now;
                let allowed = bucket.tokens >= weight as f64;
                if allowed {
                    bucket.tokens -= weight as f64;
                }
                (allowed, (limit as f64 - bucket.tokens) as u32)
            }
            LimitType::FixedWindow => {
                let window_index = (now / rule.window_seconds as f64).floor() as i64;
                let key = format!("{}:{}", rule.name, identifier);
                let mut fixed = self.fixed.write().await;
                let entry = fixed.entry(key).or_insert((window_index, 0));
                if entry.0 != window_index {
                    *entry = (window_index, 0);
                }
                entry.1 += weight;
                (entry.1 <= limit, entry.1)
            }
        };

        Ok(LimitDecision {
            allowed,
            current_count: count,
            limit,
            remaining: limit.saturating_sub(count),
            reset_time: now + rule.window_seconds as f64,
            retry_after: None,
            punishment_ends_at: None,
        })
    }

    async fn punishment_end(&self, rule: &RateLimitRule, identifier: &str) -> Result<Option<f64>> {
        let key = format!("{}:{}", rule.name, identifier);
        Ok(self.punishments.read().await.get(&key).copied())
    }

    async fn apply_punishment(&self, rule: &RateLimitRule, identifier: &str) -> Result<()> {
        let key = format!("{}:{}", rule.name, identifier);
        self.punishments.write().await.insert(key, now_secs() + rule.punishment_duration_secs as f64);
        Ok(())
    }

    async fn is_whitelisted(&self, identifier: &str) -> Result<bool> {
        let whitelist = self.whitelist.read().await;
        Ok(match whitelist.get(identifier) {
            Some(Some(expires_at)) => *expires_at > now_secs(),
            Some(None) => true,
            None => false,
        })
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Holds the rule registry and dispatches admission checks to whichever
/// backend is live, degrading to the in-memory backend if Redis never
/// connected.
pub struct RateLimitEngine {
    rules: Vec<RateLimitRule>,
    backend: Arc<dyn LimitBackend>,
    memory_fallback: Arc<MemoryBackend>,
    notify_cooldowns: RwLock<HashMap<String, f64>>,
    notify_cooldown_secs: f64,
}

impl RateLimitEngine {
    pub async fn new(redis_url: Option<&str>, rules: Vec<RateLimitRule>) -> Self {
        let memory_fallback = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn LimitBackend> = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_tokio_connection_manager().await {
                    Ok(conn) => Arc::new(RedisBackend { connection: Arc::new(tokio::sync::Mutex::new(conn)) }),
                    Err(e) => {
                        warn!(error = %e, "redis unreachable, rate limiter falling back to memory backend");
                        memory_fallback.clone()
                    }
                },
                Err(e) => {
                    warn!(error = %e, "invalid redis url, rate limiter falling back to memory backend");
                    memory_fallback.clone()
                }
            },
            None => memory_fallback.clone(),
        };
        Self { rules, backend, memory_fallback, notify_cooldowns: RwLock::new(HashMap::new()), notify_cooldown_secs: 60.0 }
    }

    /// True at most once per cooldown window per identifier (typically
    /// `<user_id>_<chat_id>`), so a rate-limited entity gets a single
    /// notification instead of one per denied message.
    pub async fn should_notify(&self, identifier: &str) -> bool {
        let now = now_secs();
        let mut cooldowns = self.notify_cooldowns.write().await;
        cooldowns.retain(|_, last| now - *last <= self.notify_cooldown_secs * 2.0);
        match cooldowns.get(identifier) {
            Some(last) if now - *last < self.notify_cooldown_secs => false,
            _ => {
                cooldowns.insert(identifier.to_string(), now);
                true
            }
        }
    }

    pub fn default_rules(requests: u32, window_secs: u64, punishment_secs: u64) -> Vec<RateLimitRule> {
        vec![RateLimitRule {
            name: "default".to_string(),
            limit_type: LimitType::SlidingWindow,
            max_requests: requests,
            window_seconds: window_secs,
            action_types: Vec::new(),
            user_groups: Vec::new(),
            burst_allowance: 0,
            punishment_duration_secs: punishment_secs,
            enabled: true,
        }]
    }

    pub async fn check(&self, identifier: &str, action: &str, group: &str, weight: u32) -> Result<LimitDecision> {
        if self.backend.is_whitelisted(identifier).await? {
            return Ok(LimitDecision {
                allowed: true,
                current_count: 0,
                limit: u32::MAX,
                remaining: u32::MAX,
                reset_time: now_secs(),
                retry_after: None,
                punishment_ends_at: None,
            });
        }

        for rule in self.rules.iter().filter(|r| r.applies_to(action, group)) {
            if let Some(ends_at) = self.backend.punishment_end(rule, identifier).await? {
                if ends_at > now_secs() {
                    return Ok(LimitDecision {
                        allowed: false,
                        current_count: rule.max_requests,
                        limit: rule.max_requests,
                        remaining: 0,
                        reset_time: ends_at,
                        retry_after: Some((ends_at - now_secs()).ceil() as u64),
                        punishment_ends_at: Some(ends_at),
                    });
                }
            }

            let decision = self.backend.check(rule, identifier, weight).await?;
            if !decision.allowed {
                if rule.punishment_duration_secs > 0 {
                    self.backend.apply_punishment(rule, identifier).await?;
                }
                return Ok(decision);
            }
        }

        Ok(LimitDecision {
            allowed: true,
            current_count: 0,
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_time: now_secs(),
            retry_after: None,
            punishment_ends_at: None,
        })
    }

    /// Only the memory path is exercised in unit tests; Redis-backed behavior
    /// is covered by integration tests run against a real instance.
    pub fn memory_backend_for_test(&self) -> Arc<MemoryBackend> {
        self.memory_fallback.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sliding_window_denies_over_limit() {
        let rule = RateLimitRule {
            name: "test".to_string(),
            limit_type: LimitType::SlidingWindow,
            max_requests: 2,
            window_seconds: 30,
            action_types: Vec::new(),
            user_groups: Vec::new(),
            burst_allowance: 0,
            punishment_duration_secs: 0,
            enabled: true,
        };
        let engine = RateLimitEngine::new(None, vec![rule]).await;
        assert!(engine.check("u1", "msg", "private", 1).await.unwrap().allowed);
        assert!(engine.check("u1", "msg", "private", 1).await.unwrap().allowed);
        assert!(!engine.check("u1", "msg", "private", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn punishment_short_circuits_further_checks() {
        let rule = RateLimitRule {
            name: "punish".to_string(),
            limit_type: LimitType::FixedWindow,
            max_requests: 1,
            window_seconds: 30,
            action_types: Vec::new(),
            user_groups: Vec::new(),
            burst_allowance: 0,
            punishment_duration_secs: 60,
            enabled: true,
        };
        let engine = RateLimitEngine::new(None, vec![rule]).await;
        assert!(engine.check("u2", "msg", "private", 1).await.unwrap().allowed);
        let denied = engine.check("u2", "msg", "private", 1).await.unwrap();
        assert!(!denied.allowed);
        let still_denied = engine.check("u2", "msg", "private", 1).await.unwrap();
        assert!(still_denied.punishment_ends_at.is_some());
    }
}
