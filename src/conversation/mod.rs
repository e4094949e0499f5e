mod locks;

pub use locks::EntityLockTable;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::cache::{ban_cache_ttl, Cache};
use crate::error::{BridgeError, Result};
use crate::platform::{
    CallOutcome, CopyMessageParams, CreateForumTopicParams, EditForumTopicParams, Method, PlatformClient, SendMessageParams,
};
use crate::store::{Conversation, ConversationStatus, EntityType, Message, MessageDirection, Store, Verification};

const MESSAGE_LIMIT_BEFORE_BIND: i64 = 10;

fn status_emoji(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Open => "🟢",
        ConversationStatus::Pending => "🟡",
        ConversationStatus::Closed => "❌",
        ConversationStatus::Resolved => "☑️",
    }
}

fn verify_emoji(verification: Verification) -> &'static str {
    match verification {
        Verification::Pending => "🔒",
        Verification::Verified => "🔗",
    }
}

/// Pure function of (entity_name, entity_id, status, verification) so topic
/// renames are idempotent: calling it twice with the same state produces the
/// same name.
pub fn build_topic_name(entity_name: &str, entity_id: i64, status: ConversationStatus, verification: Verification) -> String {
    format!("{}{} {} ({})", status_emoji(status), verify_emoji(verification), entity_name, entity_id)
}

pub enum BindOutcome {
    Bound,
    AlreadyBoundBySameEntity,
    InvalidOrUnauthorized,
    WrongPassword,
    UsedByAnotherEntity,
    BoundToDifferentId,
}

/// The conversation state machine: entity<->topic binding, verification,
/// pre-bind message cap, ban enforcement, and topic-deleted recovery.
pub struct ConversationService {
    store: Arc<Store>,
    cache: Arc<Cache>,
    platform: Arc<dyn PlatformClient>,
    support_group_id: i64,
    locks: EntityLockTable,
}

impl ConversationService {
    pub fn new(store: Arc<Store>, cache: Arc<Cache>, platform: Arc<dyn PlatformClient>, support_group_id: i64) -> Self {
        Self { store, cache, platform, support_group_id, locks: EntityLockTable::new() }
    }

    pub async fn is_banned(&self, entity_id: i64) -> Result<bool> {
        let cache_key = format!("user_banned:{entity_id}");
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached.as_bool().unwrap_or(false));
        }

        let ban = self.store.get_ban(entity_id).await?;
        let banned = match ban {
            None => false,
            Some(None) => true,
            Some(Some(until)) => {
                if until <= Utc::now() {
                    self.store.delete_ban(entity_id).await?;
                    false
                } else {
                    true
                }
            }
        };
        self.cache.set(&cache_key, json!(banned), ban_cache_ttl(banned)).await;
        Ok(banned)
    }

    pub async fn ban(&self, entity_id: i64, until: Option<chrono::DateTime<Utc>>) -> Result<()> {
        self.store.set_ban(entity_id, until).await?;
        self.cache.remove(&format!("user_banned:{entity_id}")).await;
        Ok(())
    }

    pub async fn unban(&self, entity_id: i64) -> Result<()> {
        self.store.delete_ban(entity_id).await?;
        self.cache.remove(&format!("user_banned:{entity_id}")).await;
        Ok(())
    }

    /// Serializes creation-path operations per entity so two concurrent
    /// inbound messages can't race on topic creation for the same entity.
    /// Records the message, then forwards it into the bound topic so
    /// operators see it. This is where a deleted topic surfaces as
    /// `TopicNotFound` for the coordinator to recover from.
    pub async fn on_inbound_message(
        &self,
        entity_id: i64,
        entity_type: EntityType,
        entity_name: &str,
        from_chat_id: i64,
        body: Option<String>,
        platform_message_id: i64,
    ) -> Result<Conversation> {
        let _guard = self.locks.lock(entity_id, entity_type).await;

        let existing = self.get_conversation_cached(entity_id, entity_type).await?;
        let mut conv = match existing {
            Some(conv) => conv,
            None => self.create_conversation(entity_id, entity_type, entity_name).await?,
        };

        if conv.status == ConversationStatus::Closed {
            conv.status = ConversationStatus::Open;
            self.rename_and_save(&mut conv).await?;
            info!(entity_id, "conversation reopened on inbound message");
        }

        self.store
            .record_message(&Message {
                id: 0,
                entity_id,
                entity_type,
                direction: MessageDirection::In,
                body,
                platform_message_id,
                created_at: Utc::now(),
            })
            .await?;

        if let Some(topic_id) = conv.topic_id {
            let params = CopyMessageParams {
                chat_id: self.support_group_id,
                from_chat_id,
                message_id: platform_message_id as i32,
                message_thread_id: Some(topic_id as i32),
            };
            let outcome = self.platform.call("", Method::CopyMessage, serde_json::to_value(params)?).await?;
            call_outcome_to_result(outcome)?;
        }

        if conv.verification == Verification::Pending {
            let count = self.store.increment_pre_bind_count(entity_id, entity_type).await?;
            conv.message_count_before_bind = count;
            if count >= MESSAGE_LIMIT_BEFORE_BIND {
                conv.status = ConversationStatus::Closed;
                self.rename_and_save(&mut conv).await?;
                warn!(entity_id, "pre-bind message cap reached, conversation closed");
            }
        }

        Ok(conv)
    }

    async fn create_conversation(&self, entity_id: i64, entity_type: EntityType, entity_name: &str) -> Result<Conversation> {
        let topic_name = build_topic_name(entity_name, entity_id, ConversationStatus::Open, Verification::Pending);
        let topic_id = self.create_topic(&topic_name).await?;

        let conv = Conversation {
            entity_id,
            entity_type,
            topic_id: Some(topic_id),
            status: ConversationStatus::Open,
            lang: None,
            entity_name: entity_name.to_string(),
            custom_id: None,
            verification: Verification::Pending,
            message_count_before_bind: 0,
            first_seen: Utc::now(),
        };
        self.store.create_conversation(&conv).await?;
        Ok(conv)
    }

    async fn create_topic(&self, name: &str) -> Result<i64> {
        let params = CreateForumTopicParams { chat_id: self.support_group_id, name: name.to_string() };
        match self.platform.call("", Method::CreateForumTopic, serde_json::to_value(params)?).await? {
            CallOutcome::Ok(value) => {
                let topic_id = value.get("message_thread_id").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(topic_id)
            }
            _ => Err(BridgeError::Platform("failed to create support topic".to_string())),
        }
    }

    async fn rename_and_save(&self, conv: &mut Conversation) -> Result<()> {
        if let Some(topic_id) = conv.topic_id {
            let name = build_topic_name(&conv.entity_name, conv.entity_id, conv.status, conv.verification);
            let params = EditForumTopicParams { chat_id: self.support_group_id, message_thread_id: topic_id as i32, name };
            if let Err(e) = self.platform.call("", Method::EditForumTopic, serde_json::to_value(params)?).await {
                warn!(error = %e, topic_id, "best-effort topic rename failed");
            }
        }
        self.store.save_conversation(conv).await?;
        self.cache.invalidate_conversation(conv.entity_type.as_str(), conv.entity_id, conv.topic_id).await;
        Ok(())
    }

    async fn get_conversation_cached(&self, entity_id: i64, entity_type: EntityType) -> Result<Option<Conversation>> {
        self.store.get_conversation(entity_id, entity_type).await
    }

    /// `/bind <custom_id> [password]`, covering every outcome: already bound
    /// by the same entity, wrong password, claimed by another entity, or a
    /// fresh bind.
    pub async fn bind(
        &self,
        entity_id: i64,
        entity_type: EntityType,
        custom_id: &str,
        password: Option<&str>,
    ) -> Result<BindOutcome> {
        let _guard = self.locks.lock(entity_id, entity_type).await;

        let mut conv = match self.get_conversation_cached(entity_id, entity_type).await? {
            Some(conv) => conv,
            None => return Ok(BindOutcome::InvalidOrUnauthorized),
        };

        if conv.verification == Verification::Verified {
            if conv.custom_id.as_deref() == Some(custom_id) {
                return Ok(BindOutcome::AlreadyBoundBySameEntity);
            }
            return Ok(BindOutcome::BoundToDifferentId);
        }

        let binding = match self.store.get_binding(custom_id).await? {
            Some(b) => b,
            None => return Ok(BindOutcome::InvalidOrUnauthorized),
        };

        if let Some(hash) = &binding.password_hash {
            let Some(provided) = password else { return Ok(BindOutcome::WrongPassword) };
            if !verify_password(provided, hash) {
                return Ok(BindOutcome::WrongPassword);
            }
        }

        if binding.used {
            if binding.used_by_entity_id == Some(entity_id) {
                return Ok(BindOutcome::AlreadyBoundBySameEntity);
            }
            return Ok(BindOutcome::UsedByAnotherEntity);
        }

        self.store.mark_binding_used(custom_id, entity_id).await?;

        conv.verification = Verification::Verified;
        conv.custom_id = Some(custom_id.to_string());
        conv.message_count_before_bind = 0;
        conv.status = ConversationStatus::Open;
        self.rename_and_save(&mut conv).await?;

        Ok(BindOutcome::Bound)
    }

    pub async fn close(&self, entity_id: i64, entity_type: EntityType) -> Result<()> {
        let _guard = self.locks.lock(entity_id, entity_type).await;
        if let Some(mut conv) = self.get_conversation_cached(entity_id, entity_type).await? {
            conv.status = ConversationStatus::Closed;
            self.rename_and_save(&mut conv).await?;
        }
        Ok(())
    }

    /// Called when an outbound call against an existing topic reports
    /// topic-not-found: null the topic, reopen as pending, create a fresh
    /// topic preserving verification/custom_id, and post a recovery notice.
    pub async fn recover_deleted_topic(&self, entity_id: i64, entity_type: EntityType) -> Result<i64> {
        let _guard = self.locks.lock(entity_id, entity_type).await;
        let mut conv = self
            .get_conversation_cached(entity_id, entity_type)
            .await?
            .ok_or_else(|| BridgeError::Generic("conversation missing during topic recovery".to_string()))?;

        let old_topic_id = conv.topic_id;
        conv.topic_id = None;
        conv.status = ConversationStatus::Pending;

        let name = build_topic_name(&conv.entity_name, conv.entity_id, conv.status, conv.verification);
        let new_topic_id = self.create_topic(&name).await?;
        conv.topic_id = Some(new_topic_id);
        self.store.save_conversation(&conv).await?;
        self.cache.invalidate_conversation(conv.entity_type.as_str(), conv.entity_id, old_topic_id).await;

        let notice = SendMessageRecoveryNotice { chat_id: self.support_group_id, text: "support topic was recreated after the previous one was deleted".to_string(), message_thread_id: Some(new_topic_id as i32) };
        let _ = self.platform.call("", Method::SendMessage, serde_json::to_value(notice)?).await;

        Ok(new_topic_id)
    }

    /// Routes an operator's reply, posted inside a bound topic, back to the
    /// entity's chat. The counterpart to the forwarding in
    /// `on_inbound_message`: together they make replies in the support group
    /// visible to the entity and vice versa.
    pub async fn route_operator_reply(&self, topic_id: i64, platform_message_id: i64) -> Result<()> {
        let conv = self
            .store
            .get_conversation_by_topic(topic_id)
            .await?
            .ok_or_else(|| BridgeError::Validation(format!("no conversation bound to topic {topic_id}")))?;

        let params = CopyMessageParams {
            chat_id: conv.entity_id,
            from_chat_id: self.support_group_id,
            message_id: platform_message_id as i32,
            message_thread_id: None,
        };
        let outcome = self.platform.call("", Method::CopyMessage, serde_json::to_value(params)?).await?;
        call_outcome_to_result(outcome)?;

        self.store
            .record_message(&Message {
                id: 0,
                entity_id: conv.entity_id,
                entity_type: conv.entity_type,
                direction: MessageDirection::Out,
                body: None,
                platform_message_id,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Best-effort notice sent to the denied sender's chat; wording is
    /// intentionally generic since localization lives outside this service.
    pub async fn notify_rate_limited(&self, chat_id: i64, retry_after_secs: Option<u64>) -> Result<()> {
        let text = match retry_after_secs {
            Some(secs) => format!("You're sending messages too quickly. Please wait {secs}s and try again."),
            None => "You're sending messages too quickly. Please slow down.".to_string(),
        };
        let params = SendMessageParams { chat_id, text, message_thread_id: None };
        let outcome = self.platform.call("", Method::SendMessage, serde_json::to_value(params)?).await?;
        call_outcome_to_result(outcome)
    }
}

fn call_outcome_to_result(outcome: CallOutcome) -> Result<()> {
    match outcome {
        CallOutcome::Ok(_) => Ok(()),
        CallOutcome::TopicNotFound => Err(BridgeError::TopicNotFound),
        CallOutcome::RateLimited { retry_after_secs } => Err(BridgeError::RateLimited { retry_after_secs }),
        CallOutcome::Unauthorized => Err(BridgeError::Authentication("bot unauthorized for outbound call".to_string())),
        CallOutcome::Transient(msg) => Err(BridgeError::Platform(msg)),
    }
}

#[derive(serde::Serialize)]
struct SendMessageRecoveryNotice {
    chat_id: i64,
    text: String,
    message_thread_id: Option<i32>,
}

fn verify_password(provided: &str, hash: &str) -> bool {
    use ring::constant_time::verify_slices_are_equal;
    let provided_hash = hash_password(provided);
    verify_slices_are_equal(provided_hash.as_bytes(), hash.as_bytes()).is_ok()
}

pub fn hash_password(password: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_matches_expected_scheme() {
        let name = build_topic_name("A", 555, ConversationStatus::Open, Verification::Pending);
        assert_eq!(name, "🟢🔒 A (555)");
        let bound = build_topic_name("A", 555, ConversationStatus::Open, Verification::Verified);
        assert_eq!(bound, "🟢🔗 A (555)");
    }

    #[test]
    fn password_hash_roundtrips() {
        let hash = hash_password("secret");
        assert!(verify_password("secret", &hash));
        assert!(!verify_password("wrong", &hash));
    }
}
