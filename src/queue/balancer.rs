use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::fleet::Bot;

/// Picks the lowest-scoring available bot for a queued message, honoring a
/// sticky affinity to the bot that last handled the same logical key (e.g. a
/// conversation's entity id).
pub struct LoadBalancer {
    affinity: Mutex<HashMap<String, (String, Instant)>>,
    affinity_ttl: Duration,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl LoadBalancer {
    pub fn new(affinity_ttl: Duration) -> Self {
        Self { affinity: Mutex::new(HashMap::new()), affinity_ttl }
    }

    fn score(bot: &Bot, message_weight: f64, recent_request: bool) -> f64 {
        let recency_penalty = if recent_request { 50.0 } else { 0.0 };
        let priority_bonus = (6.0 - bot.priority as f64) * 10.0;
        bot.load_score() as f64 + message_weight * 10.0 + recency_penalty - priority_bonus
    }

    pub fn message_weight(priority_weight: f64, is_admin: bool, is_group_chat: bool) -> f64 {
        let mut weight = priority_weight;
        if is_admin {
            weight *= 2.0;
        }
        if is_group_chat {
            weight *= 0.5;
        }
        weight
    }

    /// Selects a bot for `affinity_key` (typically the conversation's entity
    /// id) from the fleet's currently available bots.
    pub async fn select(&self, affinity_key: &str, available: &[Bot], message_weight: f64) -> Option<Bot> {
        {
            let affinity = self.affinity.lock().await;
            if let Some((bot_id, recorded_at)) = affinity.get(affinity_key) {
                if recorded_at.elapsed() < self.affinity_ttl {
                    if let Some(bot) = available.iter().find(|b| &b.id == bot_id) {
                        return Some(bot.clone());
                    }
                }
            }
        }

        let best = available
            .iter()
            .map(|bot| {
                let recent = bot.request_frame_started_at.elapsed() < Duration::from_secs(1);
                (Self::score(bot, message_weight, recent), bot)
            })
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, bot)| bot.clone());

        if let Some(bot) = &best {
            self.affinity.lock().await.insert(affinity_key.to_string(), (bot.id.clone(), Instant::now()));
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::BotStatus;

    fn healthy_bot(id: &str, priority: u32) -> Bot {
        let mut b = Bot::new(id, "tok", priority, 30);
        b.status = BotStatus::Healthy;
        b
    }

    #[tokio::test]
    async fn prefers_lower_priority_number() {
        let balancer = LoadBalancer::default();
        let bots = vec![healthy_bot("a", 3), healthy_bot("b", 1)];
        let selected = balancer.select("conv-1", &bots, 1.0).await.unwrap();
        assert_eq!(selected.id, "b");
    }

    #[tokio::test]
    async fn honors_affinity_once_established() {
        let balancer = LoadBalancer::default();
        let bots = vec![healthy_bot("a", 3), healthy_bot("b", 1)];
        let first = balancer.select("conv-1", &bots, 1.0).await.unwrap();
        assert_eq!(first.id, "b");
        // even though "a" now looks cheaper on paper, affinity should stick.
        let mut cheaper_a = healthy_bot("a", 0);
        cheaper_a.consecutive_failures = 0;
        let bots2 = vec![cheaper_a, healthy_bot("b", 1)];
        let second = balancer.select("conv-1", &bots2, 1.0).await.unwrap();
        assert_eq!(second.id, "b");
    }

    #[tokio::test]
    async fn returns_none_when_no_bot_available() {
        let balancer = LoadBalancer::default();
        let selected = balancer.select("conv-2", &[], 1.0).await;
        assert!(selected.is_none());
    }
}
