use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use teloxide::payloads::{
    CopyMessageSetters, CreateForumTopicSetters, EditForumTopicSetters, SendMessageSetters,
};
use teloxide::requests::Requester;
use teloxide::types::{ChatId, MessageId, ThreadId, UserId};
use teloxide::Bot;
use tracing::debug;

use crate::error::Result;

/// The method names the core actually drives. Everything else about the
/// wire format is opaque to the coordinator and conversation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GetMe,
    CreateForumTopic,
    EditForumTopic,
    SendMessage,
    CopyMessage,
    GetChat,
    GetChatMember,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetMe => "getMe",
            Method::CreateForumTopic => "createForumTopic",
            Method::EditForumTopic => "editForumTopic",
            Method::SendMessage => "sendMessage",
            Method::CopyMessage => "copyMessage",
            Method::GetChat => "getChat",
            Method::GetChatMember => "getChatMember",
        }
    }
}

/// Outcome of an outbound call, used by the coordinator and C9 to decide
/// retry vs. recovery vs. bot-errored handling.
#[derive(Debug)]
pub enum CallOutcome {
    Ok(Value),
    RateLimited { retry_after_secs: u64 },
    Unauthorized,
    TopicNotFound,
    Transient(String),
}

/// Typed parameters for each method, decoded from the opaque `params` value
/// the coordinator/conversation layer passes in.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct CreateForumTopicParams {
    pub chat_id: i64,
    pub name: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct EditForumTopicParams {
    pub chat_id: i64,
    pub message_thread_id: i32,
    pub name: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct SendMessageParams {
    pub chat_id: i64,
    pub text: String,
    #[serde(default)]
    pub message_thread_id: Option<i32>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct CopyMessageParams {
    pub chat_id: i64,
    pub from_chat_id: i64,
    pub message_id: i32,
    #[serde(default)]
    pub message_thread_id: Option<i32>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct GetChatParams {
    pub chat_id: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct GetChatMemberParams {
    pub chat_id: i64,
    pub user_id: i64,
}

/// The opaque outbound RPC surface: `call(bot_token, method, params)`. One
/// production implementation wraps `teloxide::Bot`; tests use a stub
/// implementing the same trait.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn call(&self, bot_token: &str, method: Method, params: Value) -> Result<CallOutcome>;
}

pub struct TeloxideClient {
    call_timeout: Duration,
}

impl Default for TeloxideClient {
    fn default() -> Self {
        Self { call_timeout: Duration::from_secs(30) }
    }
}

impl TeloxideClient {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

#[async_trait]
impl PlatformClient for TeloxideClient {
    async fn call(&self, bot_token: &str, method: Method, params: Value) -> Result<CallOutcome> {
        let bot = Bot::new(bot_token);
        debug!(method = method.as_str(), "dispatching platform call");

        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send>> = match method {
            Method::GetMe => {
                let bot = bot.clone();
                Box::pin(async move {
                    let me = bot.get_me().await.map_err(teloxide_err)?;
                    Ok(serde_json::to_value(me).unwrap_or(Value::Null))
                })
            }
            Method::CreateForumTopic => {
                let p: CreateForumTopicParams = serde_json::from_value(params)?;
                let bot = bot.clone();
                Box::pin(async move {
                    let topic = bot.create_forum_topic(ChatId(p.chat_id), p.name, 0, "").await.map_err(teloxide_err)?;
                    Ok(serde_json::to_value(topic).unwrap_or(Value::Null))
                })
            }
            Method::EditForumTopic => {
                let p: EditForumTopicParams = serde_json::from_value(params)?;
                let bot = bot.clone();
                Box::pin(async move {
                    bot.edit_forum_topic(ChatId(p.chat_id), ThreadId(MessageId(p.message_thread_id)))
                        .name(p.name)
                        .await
                        .map_err(teloxide_err)?;
                    Ok(Value::Bool(true))
                })
            }
            Method::SendMessage => {
                let p: SendMessageParams = serde_json::from_value(params)?;
                let bot = bot.clone();
                Box::pin(async move {
                    let mut req = bot.send_message(ChatId(p.chat_id), p.text);
                    if let Some(thread_id) = p.message_thread_id {
                        req = req.message_thread_id(ThreadId(MessageId(thread_id)));
                    }
                    let msg = req.await.map_err(teloxide_err)?;
                    Ok(serde_json::to_value(msg).unwrap_or(Value::Null))
                })
            }
            Method::CopyMessage => {
                let p: CopyMessageParams = serde_json::from_value(params)?;
                let bot = bot.clone();
                Box::pin(async move {
                    let mut req = bot.copy_message(ChatId(p.chat_id), ChatId(p.from_chat_id), MessageId(p.message_id));
                    if let Some(thread_id) = p.message_thread_id {
                        req = req.message_thread_id(ThreadId(MessageId(thread_id)));
                    }
                    let copied = req.await.map_err(teloxide_err)?;
                    Ok(serde_json::to_value(copied).unwrap_or(Value::Null))
                })
            }
            Method::GetChat => {
                let p: GetChatParams = serde_json::from_value(params)?;
                let bot = bot.clone();
                Box::pin(async move {
                    let chat = bot.get_chat(ChatId(p.chat_id)).await.map_err(teloxide_err)?;
                    Ok(serde_json::to_value(chat).unwrap_or(Value::Null))
                })
            }
            Method::GetChatMember => {
                let p: GetChatMemberParams = serde_json::from_value(params)?;
                let bot = bot.clone();
                Box::pin(async move {
                    let member = bot.get_chat_member(ChatId(p.chat_id), UserId(p.user_id as u64)).await.map_err(teloxide_err)?;
                    Ok(serde_json::to_value(member).unwrap_or(Value::Null))
                })
            }
        };

        match tokio::time::timeout(self.call_timeout, fut).await {
            Err(_) => Ok(CallOutcome::Transient("request timed out".to_string())),
            Ok(Err(e)) => Ok(classify_error(&e)),
            Ok(Ok(value)) => Ok(CallOutcome::Ok(value)),
        }
    }
}

/// Preserves the real `Retry-After` duration Telegram sent on a 429 before
/// anything downstream stringifies the error and loses it.
fn teloxide_err(e: teloxide::RequestError) -> crate::error::BridgeError {
    if let teloxide::RequestError::RetryAfter(secs) = &e {
        return crate::error::BridgeError::RateLimited { retry_after_secs: secs.duration().as_secs() };
    }
    crate::error::BridgeError::Platform(e.to_string())
}

fn classify_error(err: &crate::error::BridgeError) -> CallOutcome {
    if let crate::error::BridgeError::RateLimited { retry_after_secs } = err {
        return CallOutcome::RateLimited { retry_after_secs: *retry_after_secs };
    }
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("429") || lower.contains("too many requests") {
        // fallback for a 429 that didn't arrive as a typed RetryAfter
        CallOutcome::RateLimited { retry_after_secs: 60 }
    } else if lower.contains("401") || lower.contains("unauthorized") {
        CallOutcome::Unauthorized
    } else if lower.contains("topic") && lower.contains("not found") {
        CallOutcome::TopicNotFound
    } else if lower.contains("thread_not_found") {
        CallOutcome::TopicNotFound
    } else {
        CallOutcome::Transient(msg)
    }
}
