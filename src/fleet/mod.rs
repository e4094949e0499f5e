use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::kv::Kv;
use crate::platform::{CallOutcome, Method, PlatformClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStatus {
    Healthy,
    RateLimited,
    Error,
    Disabled,
    Unknown,
}

impl BotStatus {
    fn weight(&self) -> u32 {
        match self {
            BotStatus::Healthy => 0,
            BotStatus::Unknown => 50,
            BotStatus::RateLimited => 500,
            BotStatus::Error => 1000,
            BotStatus::Disabled => 10000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bot {
    pub id: String,
    pub token: String,
    pub display_name: String,
    pub priority: u32,
    pub max_requests_per_minute: u32,
    pub enabled: bool,
    pub status: BotStatus,
    pub last_heartbeat: Option<Instant>,
    pub last_error: Option<String>,
    pub rate_limit_reset_time: Option<Instant>,
    pub request_count: u32,
    pub request_frame_started_at: Instant,
    pub consecutive_failures: u32,
    pub health_check_count: u64,
}

impl Bot {
    pub fn new(id: impl Into<String>, token: impl Into<String>, priority: u32, max_requests_per_minute: u32) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            display_name: String::new(),
            priority,
            max_requests_per_minute,
            enabled: true,
            status: BotStatus::Unknown,
            last_heartbeat: None,
            last_error: None,
            rate_limit_reset_time: None,
            request_count: 0,
            request_frame_started_at: Instant::now(),
            consecutive_failures: 0,
            health_check_count: 0,
        }
    }

    /// Rolls the 60-second request-counting frame.
    fn roll_frame(&mut self) {
        if self.request_frame_started_at.elapsed() >= Duration::from_secs(60) {
            self.request_count = 0;
            self.request_frame_started_at = Instant::now();
        }
    }

    pub fn is_available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if !matches!(self.status, BotStatus::Healthy | BotStatus::Unknown) {
            return false;
        }
        if let Some(reset) = self.rate_limit_reset_time {
            if Instant::now() < reset {
                return false;
            }
        }
        self.request_count < self.max_requests_per_minute
    }

    pub fn load_score(&self) -> i64 {
        self.priority as i64 * 1000
            + self.request_count as i64 * 10
            + self.consecutive_failures as i64 * 100
            + self.status.weight() as i64
    }
}

/// Owns the bot instances and their three periodic loops: health-probe,
/// status-check, heartbeat.
pub struct FleetManager {
    bots: Arc<RwLock<HashMap<String, Bot>>>,
    platform: Arc<dyn PlatformClient>,
    kv: Option<Arc<dyn Kv>>,
}

impl FleetManager {
    pub fn new(platform: Arc<dyn PlatformClient>, kv: Option<Arc<dyn Kv>>) -> Self {
        Self { bots: Arc::new(RwLock::new(HashMap::new())), platform, kv }
    }

    pub async fn register(&self, bot: Bot) {
        self.bots.write().await.insert(bot.id.clone(), bot);
    }

    pub async fn get_best_bot(&self) -> Option<Bot> {
        let bots = self.bots.read().await;
        let mut healthy: Vec<&Bot> = bots.values().filter(|b| b.is_available() && b.status == BotStatus::Healthy).collect();
        healthy.sort_by_key(|b| b.load_score());
        if let Some(b) = healthy.first() {
            return Some((*b).clone());
        }
        let mut available: Vec<&Bot> = bots.values().filter(|b| b.is_available()).collect();
        available.sort_by_key(|b| b.load_score());
        available.first().map(|b| (*b).clone())
    }

    pub async fn available_bots(&self) -> Vec<Bot> {
        self.bots.read().await.values().filter(|b| b.is_available()).cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Bot> {
        self.bots.read().await.get(id).cloned()
    }

    pub async fn mark_rate_limited(&self, bot_id: &str, retry_after: Duration) {
        let mut bots = self.bots.write().await;
        if let Some(bot) = bots.get_mut(bot_id) {
            bot.status = BotStatus::RateLimited;
            bot.rate_limit_reset_time = Some(Instant::now() + retry_after);
            bot.consecutive_failures += 1;
        }
    }

    pub async fn mark_error(&self, bot_id: &str, msg: &str) {
        let mut bots = self.bots.write().await;
        if let Some(bot) = bots.get_mut(bot_id) {
            bot.status = BotStatus::Error;
            bot.last_error = Some(msg.to_string());
            bot.consecutive_failures += 1;
        }
    }

    pub async fn mark_healthy(&self, bot_id: &str) {
        let mut bots = self.bots.write().await;
        if let Some(bot) = bots.get_mut(bot_id) {
            bot.status = BotStatus::Healthy;
            bot.last_error = None;
            bot.consecutive_failures = 0;
            bot.last_heartbeat = Some(Instant::now());
        }
    }

    pub async fn record_request(&self, bot_id: &str) {
        let mut bots = self.bots.write().await;
        if let Some(bot) = bots.get_mut(bot_id) {
            bot.roll_frame();
            bot.request_count += 1;
        }
    }

    async fn probe(&self, bot_id: &str) {
        let token = match self.bots.read().await.get(bot_id) {
            Some(b) => b.token.clone(),
            None => return,
        };
        match self.platform.call(&token, Method::GetMe, json!({})).await {
            Ok(CallOutcome::Ok(_)) => self.mark_healthy(bot_id).await,
            Ok(CallOutcome::RateLimited { retry_after_secs }) => {
                self.mark_rate_limited(bot_id, Duration::from_secs(retry_after_secs)).await
            }
            Ok(CallOutcome::Unauthorized) => self.mark_error(bot_id, "invalid credentials").await,
            Ok(CallOutcome::TopicNotFound) | Ok(CallOutcome::Transient(_)) | Err(_) => {
                self.mark_error(bot_id, "health probe failed").await
            }
        }
        if let Some(bot) = self.bots.write().await.get_mut(bot_id) {
            bot.health_check_count += 1;
        }
    }

    /// Health-probe loop: every `interval`, issue a no-op identity call per
    /// bot and update its status from the outcome.
    pub fn spawn_health_probe_loop(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let ids: Vec<String> = self.bots.read().await.keys().cloned().collect();
                for id in ids {
                    self.probe(&id).await;
                }
            }
        });
    }

    /// Status-check loop (1-minute cadence): recover rate-limited bots past
    /// their reset, re-probe stale healthy bots, back off errored bots.
    pub fn spawn_status_check_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let snapshot: Vec<(String, BotStatus, Option<Instant>, Option<Instant>, u32)> = self
                    .bots
                    .read()
                    .await
                    .values()
                    .map(|b| (b.id.clone(), b.status, b.rate_limit_reset_time, b.last_heartbeat, b.consecutive_failures))
                    .collect();

                for (id, status, reset, heartbeat, failures) in snapshot {
                    match status {
                        BotStatus::RateLimited => {
                            if reset.map(|r| Instant::now() >= r).unwrap_or(true) {
                                self.probe(&id).await;
                            }
                        }
                        BotStatus::Healthy => {
                            if heartbeat.map(|h| h.elapsed() > Duration::from_secs(300)).unwrap_or(true) {
                                self.probe(&id).await;
                            }
                        }
                        BotStatus::Error | BotStatus::Unknown => {
                            let backoff = Duration::from_secs((60u64 * 2u64.pow(failures.min(5))).min(3600));
                            if heartbeat.map(|h| h.elapsed() > backoff).unwrap_or(true) {
                                self.probe(&id).await;
                            }
                        }
                        BotStatus::Disabled => {}
                    }
                }
            }
        });
    }

    /// Heartbeat loop (30-second cadence): refresh `last_heartbeat` for
    /// enabled bots and mirror status to KV with a 5-minute TTL.
    pub fn spawn_heartbeat_loop(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut bots = self.bots.write().await;
                for bot in bots.values_mut().filter(|b| b.enabled) {
                    bot.last_heartbeat = Some(Instant::now());
                    if let Some(kv) = &self.kv {
                        let kv = kv.clone();
                        let key = format!("fleet:bot:{}", bot.id);
                        let value = format!("{:?}", bot.status);
                        tokio::spawn(async move {
                            if let Err(e) = kv.set(&key, &value, Some(Duration::from_secs(300))).await {
                                warn!(error = %e, "failed to mirror bot heartbeat to kv");
                            }
                        });
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::LocalKv;
    use async_trait::async_trait;

    struct StubPlatform;
    #[async_trait]
    impl PlatformClient for StubPlatform {
        async fn call(&self, _bot_token: &str, _method: Method, _params: serde_json::Value) -> crate::error::Result<CallOutcome> {
            Ok(CallOutcome::Ok(json!({"ok": true})))
        }
    }

    #[tokio::test]
    async fn load_score_prefers_lower_priority_number() {
        let manager = FleetManager::new(Arc::new(StubPlatform), Some(Arc::new(LocalKv::new())));
        let mut a = Bot::new("a", "tok-a", 1, 30);
        a.status = BotStatus::Healthy;
        let mut b = Bot::new("b", "tok-b", 2, 30);
        b.status = BotStatus::Healthy;
        manager.register(a).await;
        manager.register(b).await;
        let best = manager.get_best_bot().await.unwrap();
        assert_eq!(best.id, "a");
    }

    #[tokio::test]
    async fn unavailable_bot_is_skipped() {
        let manager = FleetManager::new(Arc::new(StubPlatform), None);
        let mut a = Bot::new("a", "tok-a", 1, 30);
        a.status = BotStatus::Error;
        let mut b = Bot::new("b", "tok-b", 5, 30);
        b.status = BotStatus::Healthy;
        manager.register(a).await;
        manager.register(b).await;
        let best = manager.get_best_bot().await.unwrap();
        assert_eq!(best.id, "b");
    }

    #[tokio::test]
    async fn mark_rate_limited_excludes_bot_until_reset() {
        let manager = FleetManager::new(Arc::new(StubPlatform), None);
        let mut a = Bot::new("a", "tok-a", 1, 30);
        a.status = BotStatus::Healthy;
        manager.register(a).await;
        manager.mark_rate_limited("a", Duration::from_secs(60)).await;
        assert!(manager.get_best_bot().await.is_none());
    }
}
