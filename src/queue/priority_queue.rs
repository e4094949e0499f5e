use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub update_id: i64,
    pub chat_id: i64,
    pub user_id: Option<i64>,
    pub chat_type: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub created_at_ms: i64,
    pub retry_count: u32,
    pub assigned_bot_id: Option<String>,
    /// Epoch-ms deadline by which processing must complete; a worker still
    /// enforces this with its own timeout, but it now travels with the
    /// message so `cleanup_stale` doesn't need a second, separately-tuned
    /// constant to agree with.
    pub processing_deadline_ms: i64,
}

impl QueuedMessage {
    /// `priority * 10^6 + (1_000_000 - now_ms mod 10^6)`. Higher priority
    /// always wins; within a priority, the inverted millisecond suffix makes
    /// the earlier enqueue score higher so a max-pop drains it first.
    pub fn score(priority: Priority, now_ms: i64) -> f64 {
        let suffix = now_ms % 1_000_000;
        (priority as i64 * 1_000_000 + (1_000_000 - suffix)) as f64
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

struct Backend {
    redis: Option<Arc<Mutex<ConnectionManager>>>,
}

/// What's stored in the Redis `processing` hash: the claimed message itself
/// plus claim metadata, so a stale-sweep scan can requeue it without a
/// second round-trip to fetch the body.
#[derive(Debug, Serialize, Deserialize)]
struct ProcessingEntry {
    processor: String,
    claimed_at_ms: i64,
    message: QueuedMessage,
}

#[derive(Clone, Eq, PartialEq)]
struct HeapEntry {
    score: i64,
    message_id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.cmp(&other.score)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Redis sorted-set priority queue with pending/processing/dead-letter
/// states, falling back to an in-process binary heap when Redis is
/// unavailable.
pub struct PriorityQueue {
    backend: Backend,
    prefix: String,
    local_pending: Mutex<BinaryHeap<HeapEntry>>,
    local_messages: Mutex<HashMap<String, QueuedMessage>>,
    local_processing: Mutex<HashMap<String, (QueuedMessage, i64)>>,
    local_dead_letter: Mutex<Vec<QueuedMessage>>,
}

impl PriorityQueue {
    pub async fn new(redis_url: Option<&str>, prefix: &str) -> Self {
        let redis = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_tokio_connection_manager().await {
                    Ok(conn) => Some(Arc::new(Mutex::new(conn))),
                    Err(e) => {
                        warn!(error = %e, "redis unreachable, priority queue falling back to local heap");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "invalid redis url for priority queue");
                    None
                }
            },
            None => None,
        };

        Self {
            backend: Backend { redis },
            prefix: prefix.to_string(),
            local_pending: Mutex::new(BinaryHeap::new()),
            local_messages: Mutex::new(HashMap::new()),
            local_processing: Mutex::new(HashMap::new()),
            local_dead_letter: Mutex::new(Vec::new()),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    pub async fn enqueue(&self, msg: QueuedMessage) -> Result<()> {
        let score = QueuedMessage::score(msg.priority, msg.created_at_ms);
        if let Some(redis) = &self.backend.redis {
            let mut conn = redis.lock().await;
            let serialized = serde_json::to_string(&msg)?;
            let _: () = conn
                .zadd(self.key("pending"), serialized, score)
                .await
                .map_err(|e| BridgeError::Kv(e.to_string()))?;
            return Ok(());
        }
        let mut pending = self.local_pending.lock().await;
        pending.push(HeapEntry { score: score as i64, message_id: msg.message_id.clone() });
        self.local_messages.lock().await.insert(msg.message_id.clone(), msg);
        Ok(())
    }

    /// Pops the highest-scored message out of pending into processing,
    /// stamping the instance id that claimed it.
    pub async fn dequeue(&self, processor_instance: &str) -> Result<Option<QueuedMessage>> {
        if let Some(redis) = &self.backend.redis {
            let mut conn = redis.lock().await;
            let popped: Vec<(String, f64)> =
                conn.zpopmax(self.key("pending"), 1).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
            if let Some((serialized, _score)) = popped.into_iter().next() {
                let msg: QueuedMessage = serde_json::from_str(&serialized)?;
                let processing_key = self.key("processing");
                let entry = ProcessingEntry {
                    processor: processor_instance.to_string(),
                    claimed_at_ms: now_ms(),
                    message: msg.clone(),
                };
                let _: () = conn
                    .hset(&processing_key, &msg.message_id, serde_json::to_string(&entry)?)
                    .await
                    .map_err(|e| BridgeError::Kv(e.to_string()))?;
                return Ok(Some(msg));
            }
            return Ok(None);
        }

        let popped = { self.local_pending.lock().await.pop() };
        if let Some(entry) = popped {
            let msg = self.local_messages.lock().await.remove(&entry.message_id);
            if let Some(msg) = msg {
                self.local_processing.lock().await.insert(msg.message_id.clone(), (msg.clone(), now_ms()));
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    pub async fn mark_completed(&self, message_id: &str) -> Result<()> {
        if let Some(redis) = &self.backend.redis {
            let mut conn = redis.lock().await;
            let _: () =
                conn.hdel(self.key("processing"), message_id).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
            return Ok(());
        }
        self.local_processing.lock().await.remove(message_id);
        Ok(())
    }

    pub async fn mark_failed(&self, message_id: &str, mut msg: QueuedMessage) -> Result<()> {
        self.mark_completed(message_id).await?;
        msg.retry_count += 1;
        if msg.retry_count >= 3 {
            if let Some(redis) = &self.backend.redis {
                let mut conn = redis.lock().await;
                let serialized = serde_json::to_string(&msg)?;
                let _: () = conn
                    .lpush(self.key("dead_letter"), serialized)
                    .await
                    .map_err(|e| BridgeError::Kv(e.to_string()))?;
            } else {
                self.local_dead_letter.lock().await.push(msg);
            }
        } else {
            msg.created_at_ms = now_ms();
            self.enqueue(msg).await?;
        }
        Ok(())
    }

    /// Scans processing for entries older than `timeout` and treats each as
    /// failed, recovering messages stuck from a crash or a stalled worker.
    pub async fn cleanup_stale(&self, timeout: Duration) -> Result<usize> {
        let cutoff = now_ms() - timeout.as_millis() as i64;
        let mut recovered = 0;

        if let Some(redis) = &self.backend.redis {
            let processing_key = self.key("processing");
            let entries: HashMap<String, String> = {
                let mut conn = redis.lock().await;
                conn.hgetall(&processing_key).await.map_err(|e| BridgeError::Kv(e.to_string()))?
            };
            for (id, raw) in entries {
                let Ok(entry) = serde_json::from_str::<ProcessingEntry>(&raw) else {
                    warn!(message_id = id, "dropping unparseable processing entry during stale sweep");
                    continue;
                };
                if entry.claimed_at_ms < cutoff {
                    self.mark_failed(&id, entry.message).await?;
                    recovered += 1;
                }
            }
            return Ok(recovered);
        }

        let stale_ids: Vec<String> = {
            let processing = self.local_processing.lock().await;
            processing.iter().filter(|(_, (_, stamped))| *stamped < cutoff).map(|(id, _)| id.clone()).collect()
        };
        for id in stale_ids {
            if let Some((msg, _)) = self.local_processing.lock().await.remove(&id) {
                self.mark_failed(&id, msg).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub async fn dead_letter_len(&self) -> usize {
        if let Some(redis) = &self.backend.redis {
            let mut conn = redis.lock().await;
            return conn.llen(self.key("dead_letter")).await.unwrap_or(0);
        }
        self.local_dead_letter.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, priority: Priority) -> QueuedMessage {
        QueuedMessage {
            message_id: id.to_string(),
            update_id: 1,
            chat_id: 1,
            user_id: None,
            chat_type: "private".to_string(),
            priority,
            payload: serde_json::json!({}),
            created_at_ms: now_ms(),
            retry_count: 0,
            assigned_bot_id: None,
            processing_deadline_ms: now_ms() + 300_000,
        }
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let queue = PriorityQueue::new(None, "test").await;
        queue.enqueue(sample("low", Priority::Low)).await.unwrap();
        queue.enqueue(sample("urgent", Priority::Urgent)).await.unwrap();
        queue.enqueue(sample("normal", Priority::Normal)).await.unwrap();

        let first = queue.dequeue("worker-1").await.unwrap().unwrap();
        assert_eq!(first.message_id, "urgent");
    }

    #[tokio::test]
    async fn retry_exhaustion_moves_to_dead_letter() {
        let queue = PriorityQueue::new(None, "test").await;
        let msg = sample("m1", Priority::Normal);
        queue.enqueue(msg.clone()).await.unwrap();
        let popped = queue.dequeue("w").await.unwrap().unwrap();
        queue.mark_failed(&popped.message_id, popped.clone()).await.unwrap();
        let popped = queue.dequeue("w").await.unwrap().unwrap();
        queue.mark_failed(&popped.message_id, popped.clone()).await.unwrap();
        let popped = queue.dequeue("w").await.unwrap().unwrap();
        queue.mark_failed(&popped.message_id, popped).await.unwrap();

        assert_eq!(queue.dead_letter_len().await, 1);
        assert!(queue.dequeue("w").await.unwrap().is_none());
    }
}
