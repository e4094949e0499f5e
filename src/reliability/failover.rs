use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::fleet::{BotStatus, FleetManager};
use crate::log_failover_event;

#[derive(Debug, Clone)]
pub struct FailoverEvent {
    pub event_id: String,
    pub failed_bot_id: String,
    pub reason: String,
    pub timestamp: Instant,
    pub target_bot_id: Option<String>,
    pub recovery_time: Option<Instant>,
}

#[derive(Default)]
struct BotFailureState {
    failure_count: u32,
    last_failure: Option<Instant>,
    suppressed: bool,
}

/// Decides bot replacement after repeated failures and tracks recovery
/// events for each transition.
pub struct FailoverManager {
    fleet: Arc<FleetManager>,
    failure_threshold: u32,
    suppression_window: Duration,
    recovery_check_interval: Duration,
    state: RwLock<HashMap<String, BotFailureState>>,
    journal: RwLock<Vec<FailoverEvent>>,
}

impl FailoverManager {
    pub fn new(fleet: Arc<FleetManager>, failure_threshold: u32, recovery_check_interval: Duration) -> Self {
        Self {
            fleet,
            failure_threshold,
            suppression_window: Duration::from_secs(60),
            recovery_check_interval,
            state: RwLock::new(HashMap::new()),
            journal: RwLock::new(Vec::new()),
        }
    }

    /// Returns the replacement bot id, if a failover was triggered.
    pub async fn handle_failure(&self, bot_id: &str, reason: &str) -> Option<String> {
        let mut state = self.state.write().await;
        let entry = state.entry(bot_id.to_string()).or_default();

        if let Some(last) = entry.last_failure {
            if last.elapsed() < self.suppression_window && !entry.suppressed {
                return None;
            }
        }

        entry.failure_count += 1;
        entry.last_failure = Some(Instant::now());

        if entry.failure_count < self.failure_threshold {
            return None;
        }

        entry.suppressed = true;
        drop(state);

        self.fleet.mark_error(bot_id, reason).await;

        let target = self.select_replacement(bot_id).await;

        let event = FailoverEvent {
            event_id: Uuid::new_v4().to_string(),
            failed_bot_id: bot_id.to_string(),
            reason: reason.to_string(),
            timestamp: Instant::now(),
            target_bot_id: target.clone(),
            recovery_time: None,
        };
        log_failover_event!(bot_id, target.as_deref().unwrap_or("none"), reason);
        self.journal.write().await.push(event);

        target
    }

    async fn select_replacement(&self, failed_bot_id: &str) -> Option<String> {
        let mut candidates = self.fleet.available_bots().await;
        candidates.retain(|b| b.id != failed_bot_id);
        candidates.sort_by(|a, b| {
            let a_healthy = a.status == BotStatus::Healthy;
            let b_healthy = b.status == BotStatus::Healthy;
            b_healthy.cmp(&a_healthy).then(b.priority.cmp(&a.priority).reverse())
        });
        candidates.into_iter().next().map(|b| b.id)
    }

    /// Recovery loop: every `recovery_check_interval`, re-probe bots with an
    /// open failover event; on success, stamp recovery and reset state.
    pub fn spawn_recovery_loop(self: Arc<Self>) {
        let interval = self.recovery_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let failed_ids: Vec<String> = {
                    let journal = self.journal.read().await;
                    journal.iter().filter(|e| e.recovery_time.is_none()).map(|e| e.failed_bot_id.clone()).collect()
                };
                for bot_id in failed_ids {
                    if let Some(bot) = self.fleet.get(&bot_id).await {
                        if bot.status == BotStatus::Healthy {
                            self.mark_recovered(&bot_id).await;
                        }
                    }
                }
            }
        });
    }

    async fn mark_recovered(&self, bot_id: &str) {
        let now = Instant::now();
        let mut journal = self.journal.write().await;
        for event in journal.iter_mut().filter(|e| e.failed_bot_id == bot_id && e.recovery_time.is_none()) {
            event.recovery_time = Some(now);
        }
        drop(journal);
        self.state.write().await.remove(bot_id);
    }

    pub async fn active_events(&self) -> Vec<FailoverEvent> {
        self.journal.read().await.iter().filter(|e| e.recovery_time.is_none()).cloned().collect()
    }

    pub async fn events_for_bot(&self, bot_id: &str) -> Vec<FailoverEvent> {
        self.journal.read().await.iter().filter(|e| e.failed_bot_id == bot_id).cloned().collect()
    }

    /// MTTR: mean time between a failover event opening and its recovery.
    pub async fn mttr(&self) -> Option<Duration> {
        let journal = self.journal.read().await;
        let resolved: Vec<Duration> =
            journal.iter().filter_map(|e| e.recovery_time.map(|r| r.duration_since(e.timestamp))).collect();
        if resolved.is_empty() {
            None
        } else {
            Some(resolved.iter().sum::<Duration>() / resolved.len() as u32)
        }
    }

    /// MTBF over `period`: period divided by the number of events for the bot.
    pub async fn mtbf(&self, bot_id: &str, period: Duration) -> Option<Duration> {
        let count = self.events_for_bot(bot_id).await.len();
        if count == 0 {
            None
        } else {
            Some(period / count as u32)
        }
    }

    /// availability = (period - sum of downtime) / period, downtime measured
    /// per-event as time-to-recovery (or "still down" up to now).
    pub async fn availability(&self, bot_id: &str, period: Duration) -> f64 {
        let now = Instant::now();
        let events = self.events_for_bot(bot_id).await;
        let downtime: Duration = events
            .iter()
            .map(|e| e.recovery_time.unwrap_or(now).saturating_duration_since(e.timestamp))
            .sum();
        let period_secs = period.as_secs_f64();
        if period_secs <= 0.0 {
            return 1.0;
        }
        ((period_secs - downtime.as_secs_f64()).max(0.0) / period_secs).clamp(0.0, 1.0)
    }
}

pub fn unix_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::Bot;
    use crate::platform::{CallOutcome, Method, PlatformClient};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubPlatform;
    #[async_trait]
    impl PlatformClient for StubPlatform {
        async fn call(&self, _bot_token: &str, _method: Method, _params: serde_json::Value) -> crate::error::Result<CallOutcome> {
            Ok(CallOutcome::Ok(json!({})))
        }
    }

    #[tokio::test]
    async fn no_failover_before_threshold() {
        let fleet = Arc::new(FleetManager::new(Arc::new(StubPlatform), None));
        fleet.register(Bot::new("a", "t", 1, 30)).await;
        fleet.register(Bot::new("b", "t", 2, 30)).await;
        let manager = FailoverManager::new(fleet, 3, Duration::from_secs(300));
        assert!(manager.handle_failure("a", "timeout").await.is_none());
        assert!(manager.handle_failure("a", "timeout").await.is_none());
    }

    #[tokio::test]
    async fn failover_triggers_at_threshold_and_selects_other_bot() {
        let fleet = Arc::new(FleetManager::new(Arc::new(StubPlatform), None));
        let mut a = Bot::new("a", "t", 1, 30);
        a.status = BotStatus::Healthy;
        let mut b = Bot::new("b", "t", 2, 30);
        b.status = BotStatus::Healthy;
        fleet.register(a).await;
        fleet.register(b).await;

        let manager = FailoverManager::new(fleet, 1, Duration::from_secs(300));
        let target = manager.handle_failure("a", "timeout").await;
        assert_eq!(target, Some("b".to_string()));
        assert_eq!(manager.active_events().await.len(), 1);
    }
}
