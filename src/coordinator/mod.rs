use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::conversation::ConversationService;
use crate::error::{BridgeError, Result};
use crate::fleet::FleetManager;
use crate::kv::{acquire_lock, release_lock, Kv};
use crate::queue::{LoadBalancer, Priority, PriorityQueue, QueuedMessage};
use crate::rate_limit::RateLimitEngine;
use crate::reliability::{CircuitBreakerRegistry, RetryPolicy};
use crate::store::EntityType;

const DEDUPE_LOCK_TTL: Duration = Duration::from_secs(60);
const PROCESSING_DEADLINE: Duration = Duration::from_secs(300);

/// The raw shape of an inbound webhook update, decoded only as far as the
/// coordinator needs: everything else stays opaque payload for C9.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct InboundUpdate {
    pub update_id: i64,
    pub chat_id: i64,
    pub user_id: Option<i64>,
    pub chat_type: String,
    pub entity_name: String,
    pub text: Option<String>,
    pub platform_message_id: i64,
    #[serde(default)]
    pub message_thread_id: Option<i32>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Retry,
    DeadLetter,
}

/// `message_id = first 16 hex chars of md5(update_id || chat_id || monotonic_ms)`.
/// The monotonic counter keeps ids unique even when two updates share the
/// same (update_id, chat_id) pair across retried webhook deliveries.
fn derive_message_id(update_id: i64, chat_id: i64, monotonic_ms: u64) -> String {
    let input = format!("{update_id}{chat_id}{monotonic_ms}");
    let digest = md5::compute(input.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

/// End-to-end ingress pipeline: dedupe -> rate-limit -> prioritize -> select
/// bot -> enqueue, plus the worker pool that drains the queue into the
/// conversation state machine.
pub struct Coordinator {
    kv: Arc<dyn Kv>,
    queue: Arc<PriorityQueue>,
    balancer: Arc<LoadBalancer>,
    fleet: Arc<FleetManager>,
    rate_limit: Arc<RateLimitEngine>,
    conversation: Arc<ConversationService>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    retry_policy: RetryPolicy,
    instance_id: String,
    sequence: AtomicU64,
    admin_user_ids: Vec<i64>,
    support_group_id: i64,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn Kv>,
        queue: Arc<PriorityQueue>,
        balancer: Arc<LoadBalancer>,
        fleet: Arc<FleetManager>,
        rate_limit: Arc<RateLimitEngine>,
        conversation: Arc<ConversationService>,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
        instance_id: impl Into<String>,
        admin_user_ids: Vec<i64>,
        support_group_id: i64,
    ) -> Self {
        Self {
            kv,
            queue,
            balancer,
            fleet,
            rate_limit,
            conversation,
            circuit_breakers,
            retry_policy: RetryPolicy::default(),
            instance_id: instance_id.into(),
            sequence: AtomicU64::new(0),
            admin_user_ids,
            support_group_id,
        }
    }

    /// HIGH if the sender is an admin, NORMAL for private chat, HIGH for the
    /// support group itself (operator replies), LOW otherwise.
    fn classify_priority(update: &InboundUpdate, admin_user_ids: &[i64], support_group_id: i64) -> Priority {
        if update.user_id.map(|id| admin_user_ids.contains(&id)).unwrap_or(false) {
            Priority::High
        } else if update.chat_type == "private" {
            Priority::Normal
        } else if update.chat_id == support_group_id {
            Priority::High
        } else {
            Priority::Low
        }
    }

    fn boost(priority: Priority) -> Priority {
        match priority {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High => Priority::Urgent,
            Priority::Urgent => Priority::Urgent,
        }
    }

    /// Ingress entry point. Returns `Ok(true)` if the update was admitted and
    /// enqueued, `Ok(false)` if it was silently dropped (duplicate, banned,
    /// rate-limited).
    pub async fn coordinate(&self, update: InboundUpdate) -> Result<bool> {
        let monotonic = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message_id = derive_message_id(update.update_id, update.chat_id, monotonic);

        let lock_key = format!("msg:{message_id}");
        let guard = match acquire_lock(self.kv.as_ref(), &lock_key, DEDUPE_LOCK_TTL).await? {
            Some(guard) => guard,
            None => {
                info!(message_id, "duplicate update suppressed by dedupe lock");
                return Ok(false);
            }
        };

        let entity_id = update.user_id.unwrap_or(update.chat_id);

        // Messages arriving inside a topic of the support group itself are
        // operator replies being routed back, not customer traffic: they
        // skip ban/rate-limit admission entirely.
        let is_operator_reply = update.chat_id == self.support_group_id && update.message_thread_id.is_some();

        if !is_operator_reply {
            if self.conversation.is_banned(entity_id).await? {
                release_lock(self.kv.as_ref(), guard).await.ok();
                info!(entity_id, "update dropped, entity is banned");
                return Ok(false);
            }

            let decision = self.rate_limit.check(&entity_id.to_string(), "inbound_message", &update.chat_type, 1).await?;
            if !decision.allowed {
                release_lock(self.kv.as_ref(), guard).await.ok();
                warn!(entity_id, retry_after = ?decision.retry_after, "update dropped, rate limited");
                let notify_key = format!("{entity_id}_{}", update.chat_id);
                if self.rate_limit.should_notify(&notify_key).await {
                    if let Err(e) = self.conversation.notify_rate_limited(update.chat_id, decision.retry_after).await {
                        warn!(error = %e, entity_id, "failed to deliver rate-limit notification");
                    }
                }
                return Ok(false);
            }
        }

        let priority = Self::classify_priority(&update, &self.admin_user_ids, self.support_group_id);
        let message_weight = LoadBalancer::message_weight(priority as i64 as f64, false, update.chat_type != "private");
        let available = self.fleet.available_bots().await;
        let bot = self.balancer.select(&entity_id.to_string(), &available, message_weight).await;

        let Some(bot) = bot else {
            release_lock(self.kv.as_ref(), guard).await.ok();
            warn!(entity_id, "no bot available, update dropped");
            return Ok(false);
        };

        let now = now_ms();
        let queued = QueuedMessage {
            message_id: message_id.clone(),
            update_id: update.update_id,
            chat_id: update.chat_id,
            user_id: update.user_id,
            chat_type: update.chat_type.clone(),
            priority,
            payload: serde_json::json!({
                "entity_name": update.entity_name,
                "text": update.text,
                "platform_message_id": update.platform_message_id,
                "message_thread_id": update.message_thread_id,
                "payload": update.payload,
            }),
            created_at_ms: now,
            retry_count: 0,
            assigned_bot_id: Some(bot.id.clone()),
            processing_deadline_ms: now + PROCESSING_DEADLINE.as_millis() as i64,
        };
        self.queue.enqueue(queued).await?;

        // The dedupe lock's job ends once the message is durably enqueued;
        // release it early so a legitimate retry of the same update after
        // enqueue failure isn't blocked for the full 60s TTL.
        release_lock(self.kv.as_ref(), guard).await.ok();
        Ok(true)
    }

    async fn process_one(&self, msg: QueuedMessage) -> ProcessOutcome {
        let entity_id = msg.user_id.unwrap_or(msg.chat_id);
        let entity_type = if msg.chat_type == "private" { EntityType::User } else { EntityType::Group };
        let entity_name = msg.payload.get("entity_name").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let text = msg.payload.get("text").and_then(|v| v.as_str()).map(|s| s.to_string());
        let platform_message_id = msg.payload.get("platform_message_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let message_thread_id = msg.payload.get("message_thread_id").and_then(|v| v.as_i64());
        let is_operator_reply = msg.chat_id == self.support_group_id && message_thread_id.is_some();

        let bot_id = msg.assigned_bot_id.clone().unwrap_or_default();
        let breaker = self.circuit_breakers.get(&bot_id).await;
        if !breaker.can_execute().await {
            breaker.record_rejected().await;
            warn!(bot_id, "circuit open, deferring message for retry");
            return ProcessOutcome::Retry;
        }

        let remaining = Duration::from_millis((msg.processing_deadline_ms - now_ms()).max(0) as u64);
        let deadline = timeout(remaining, async {
            if is_operator_reply {
                let topic_id = message_thread_id.unwrap_or_default();
                self.conversation.route_operator_reply(topic_id, platform_message_id).await
            } else {
                self.conversation
                    .on_inbound_message(entity_id, entity_type, &entity_name, msg.chat_id, text, platform_message_id)
                    .await
                    .map(|_| ())
            }
        })
        .await;

        match deadline {
            Err(_) => {
                breaker.record_failure(&bot_id).await;
                warn!(message_id = %msg.message_id, "processing deadline exceeded");
                ProcessOutcome::Retry
            }
            Ok(Err(BridgeError::TopicNotFound)) => match self.conversation.recover_deleted_topic(entity_id, entity_type).await {
                Err(e) => {
                    error!(error = %e, "topic recovery failed");
                    breaker.record_failure(&bot_id).await;
                    ProcessOutcome::Retry
                }
                Ok(_) => {
                    breaker.record_success().await;
                    let monotonic = self.sequence.fetch_add(1, Ordering::Relaxed);
                    let mut requeued = msg.clone();
                    requeued.message_id = derive_message_id(requeued.update_id, requeued.chat_id, monotonic);
                    requeued.priority = Self::boost(requeued.priority);
                    requeued.retry_count = 0;
                    requeued.created_at_ms = now_ms();
                    requeued.processing_deadline_ms = now_ms() + PROCESSING_DEADLINE.as_millis() as i64;
                    if let Err(e) = self.queue.enqueue(requeued).await {
                        error!(error = %e, message_id = %msg.message_id, "failed to re-enqueue message after topic recovery");
                    }
                    ProcessOutcome::Completed
                }
            },
            Ok(Err(e)) if e.is_retryable() => {
                breaker.record_failure(&bot_id).await;
                warn!(error = %e, message_id = %msg.message_id, "transient processing failure");
                ProcessOutcome::Retry
            }
            Ok(Err(e)) => {
                error!(error = %e, message_id = %msg.message_id, "permanent processing failure");
                ProcessOutcome::DeadLetter
            }
            Ok(Ok(_)) => {
                breaker.record_success().await;
                ProcessOutcome::Completed
            }
        }
    }

    /// One worker: `dequeue -> process -> mark`, looping until shutdown.
    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let processor_instance = format!("{}-worker-{worker_id}", self.instance_id);
        loop {
            let msg = match self.queue.dequeue(&processor_instance).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let message_id = msg.message_id.clone();
            match self.process_one(msg.clone()).await {
                ProcessOutcome::Completed => {
                    if let Err(e) = self.queue.mark_completed(&message_id).await {
                        error!(error = %e, message_id, "failed to mark message completed");
                    }
                }
                ProcessOutcome::Retry => {
                    let delay = self.retry_policy.delay_for(msg.retry_count);
                    tokio::time::sleep(delay).await;
                    if let Err(e) = self.queue.mark_failed(&message_id, msg).await {
                        error!(error = %e, message_id, "failed to requeue message");
                    }
                }
                ProcessOutcome::DeadLetter => {
                    let mut dead = msg;
                    dead.retry_count = 3;
                    if let Err(e) = self.queue.mark_failed(&message_id, dead).await {
                        error!(error = %e, message_id, "failed to dead-letter message");
                    }
                }
            }
        }
    }

    /// Spawns `worker_count` worker loops plus the stale-processing sweeper.
    pub fn spawn_workers(self: &Arc<Self>, worker_count: usize) {
        for worker_id in 0..worker_count {
            tokio::spawn(self.clone().worker_loop(worker_id));
        }
        self.spawn_stale_sweeper();
    }

    fn spawn_stale_sweeper(self: &Arc<Self>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                match coordinator.queue.cleanup_stale(PROCESSING_DEADLINE).await {
                    Ok(recovered) if recovered > 0 => info!(recovered, "recovered stale in-flight messages"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "stale sweep failed"),
                }
            }
        });
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_is_sixteen_hex_chars() {
        let id = derive_message_id(1, 2, 3);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn message_id_differs_across_monotonic_counter() {
        let a = derive_message_id(1, 2, 1);
        let b = derive_message_id(1, 2, 2);
        assert_ne!(a, b);
    }

    fn sample_update(chat_id: i64, user_id: Option<i64>, chat_type: &str) -> InboundUpdate {
        InboundUpdate {
            update_id: 1,
            chat_id,
            user_id,
            chat_type: chat_type.to_string(),
            entity_name: "A".to_string(),
            text: None,
            platform_message_id: 1,
            message_thread_id: None,
            payload: Value::Null,
        }
    }

    #[test]
    fn private_chat_classifies_normal_priority() {
        let update = sample_update(1, Some(1), "private");
        assert_eq!(Coordinator::classify_priority(&update, &[], 999), Priority::Normal);
    }

    #[test]
    fn admin_sender_classifies_high_priority_regardless_of_chat() {
        let update = sample_update(1, Some(42), "group");
        assert_eq!(Coordinator::classify_priority(&update, &[42], 999), Priority::High);
    }

    #[test]
    fn support_group_chat_classifies_high_priority() {
        let update = sample_update(999, Some(7), "group");
        assert_eq!(Coordinator::classify_priority(&update, &[], 999), Priority::High);
    }

    #[test]
    fn other_group_chat_classifies_low_priority() {
        let update = sample_update(1, Some(7), "group");
        assert_eq!(Coordinator::classify_priority(&update, &[], 999), Priority::Low);
    }

    #[test]
    fn boost_caps_at_urgent() {
        assert_eq!(Coordinator::boost(Priority::Low), Priority::Normal);
        assert_eq!(Coordinator::boost(Priority::Urgent), Priority::Urgent);
    }
}
