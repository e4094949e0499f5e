use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::info;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    User,
    Group,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Group => "group",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(EntityType::User),
            "group" => Ok(EntityType::Group),
            other => Err(BridgeError::Validation(format!("unknown entity_type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Open,
    Pending,
    Closed,
    Resolved,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Pending => "pending",
            ConversationStatus::Closed => "closed",
            ConversationStatus::Resolved => "resolved",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(ConversationStatus::Open),
            "pending" => Ok(ConversationStatus::Pending),
            "closed" => Ok(ConversationStatus::Closed),
            "resolved" => Ok(ConversationStatus::Resolved),
            other => Err(BridgeError::Validation(format!("unknown conversation status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Pending,
    Verified,
}

impl Verification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verification::Pending => "pending",
            Verification::Verified => "verified",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Verification::Pending),
            "verified" => Ok(Verification::Verified),
            other => Err(BridgeError::Validation(format!("unknown verification state: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub entity_id: i64,
    pub entity_type: EntityType,
    pub topic_id: Option<i64>,
    pub status: ConversationStatus,
    pub lang: Option<String>,
    pub entity_name: String,
    pub custom_id: Option<String>,
    pub verification: Verification,
    pub message_count_before_bind: i64,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    In,
    Out,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::In => "in",
            MessageDirection::Out => "out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub entity_id: i64,
    pub entity_type: EntityType,
    pub direction: MessageDirection,
    pub body: Option<String>,
    pub platform_message_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BindingId {
    pub custom_id: String,
    pub password_hash: Option<String>,
    pub used: bool,
    pub used_by_entity_id: Option<i64>,
}

/// A pooled SQLite connection store: a small set of connections guarded by
/// a semaphore, grown lazily up to `max_connections`.
pub struct Store {
    connections: Arc<Mutex<Vec<Arc<Mutex<Connection>>>>>,
    semaphore: Arc<Semaphore>,
    database_path: String,
    max_connections: usize,
}

impl Store {
    pub async fn new(database_path: impl AsRef<Path>, max_connections: usize) -> Result<Self> {
        if let Some(parent) = database_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            connections: Arc::new(Mutex::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            database_path: database_path.as_ref().to_string_lossy().into_owned(),
            max_connections,
        };
        store.initialize_connections().await?;
        Ok(store)
    }

    async fn initialize_connections(&self) -> Result<()> {
        let mut connections = self.connections.lock().await;
        for _ in 0..std::cmp::min(3, self.max_connections) {
            let conn = self.create_connection()?;
            connections.push(Arc::new(Mutex::new(conn)));
        }
        info!(count = connections.len(), "store connection pool initialized");
        if let Some(first) = connections.first() {
            let conn = first.lock().await;
            Self::create_schema(&conn)?;
        }
        Ok(())
    }

    fn create_connection(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.database_path, flags)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                entity_id INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                topic_id INTEGER UNIQUE,
                status TEXT NOT NULL DEFAULT 'open',
                lang TEXT,
                entity_name TEXT NOT NULL,
                custom_id TEXT,
                verification TEXT NOT NULL DEFAULT 'pending',
                message_count_before_bind INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                PRIMARY KEY (entity_id, entity_type)
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                body TEXT,
                platform_message_id INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_entity_created
                ON messages (entity_id, created_at);
            CREATE TABLE IF NOT EXISTS bans (
                entity_id INTEGER PRIMARY KEY,
                until TEXT
            );
            CREATE TABLE IF NOT EXISTS binding_ids (
                custom_id TEXT PRIMARY KEY,
                password_hash TEXT,
                used INTEGER NOT NULL DEFAULT 0,
                used_by_entity_id INTEGER
            );
            CREATE TABLE IF NOT EXISTS failover_events (
                event_id TEXT PRIMARY KEY,
                failed_bot_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                target_bot_id TEXT,
                recovery_time TEXT,
                metadata TEXT
            );",
        )?;
        Ok(())
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let _permit = self.semaphore.acquire().await.map_err(|e| BridgeError::Generic(e.to_string()))?;
        let conn = loop {
            let maybe = {
                let mut conns = self.connections.lock().await;
                conns.pop()
            };
            if let Some(conn) = maybe {
                break conn;
            }
            let count = self.connections.lock().await.len();
            if count < self.max_connections {
                break Arc::new(Mutex::new(self.create_connection()?));
            }
            sleep(Duration::from_millis(10)).await;
        };
        let result = {
            let guard = conn.lock().await;
            f(&guard)
        };
        self.connections.lock().await.push(conn);
        result
    }

    pub async fn get_conversation(&self, entity_id: i64, entity_type: EntityType) -> Result<Option<Conversation>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_id, entity_type, topic_id, status, lang, entity_name, custom_id,
                        verification, message_count_before_bind, first_seen
                 FROM conversations WHERE entity_id = ?1 AND entity_type = ?2",
            )?;
            let row = stmt
                .query_row(params![entity_id, entity_type.as_str()], row_to_conversation)
                .map(Some)
                .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })?;
            Ok(row)
        })
        .await
    }

    pub async fn get_conversation_by_topic(&self, topic_id: i64) -> Result<Option<Conversation>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_id, entity_type, topic_id, status, lang, entity_name, custom_id,
                        verification, message_count_before_bind, first_seen
                 FROM conversations WHERE topic_id = ?1",
            )?;
            let row = stmt
                .query_row(params![topic_id], row_to_conversation)
                .map(Some)
                .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })?;
            Ok(row)
        })
        .await
    }

    pub async fn create_conversation(&self, conv: &Conversation) -> Result<()> {
        self.with_conn({
            let conv = conv.clone();
            move |conn| {
                conn.execute(
                    "INSERT INTO conversations
                        (entity_id, entity_type, topic_id, status, lang, entity_name, custom_id,
                         verification, message_count_before_bind, first_seen)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        conv.entity_id,
                        conv.entity_type.as_str(),
                        conv.topic_id,
                        conv.status.as_str(),
                        conv.lang,
                        conv.entity_name,
                        conv.custom_id,
                        conv.verification.as_str(),
                        conv.message_count_before_bind,
                        conv.first_seen.to_rfc3339(),
                    ],
                )?;
                Ok(())
            }
        })
        .await
    }

    pub async fn save_conversation(&self, conv: &Conversation) -> Result<()> {
        self.with_conn({
            let conv = conv.clone();
            move |conn| {
                conn.execute(
                    "UPDATE conversations SET topic_id=?3, status=?4, lang=?5, entity_name=?6,
                        custom_id=?7, verification=?8, message_count_before_bind=?9
                     WHERE entity_id=?1 AND entity_type=?2",
                    params![
                        conv.entity_id,
                        conv.entity_type.as_str(),
                        conv.topic_id,
                        conv.status.as_str(),
                        conv.lang,
                        conv.entity_name,
                        conv.custom_id,
                        conv.verification.as_str(),
                        conv.message_count_before_bind,
                    ],
                )?;
                Ok(())
            }
        })
        .await
    }

    pub async fn increment_pre_bind_count(&self, entity_id: i64, entity_type: EntityType) -> Result<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE conversations SET message_count_before_bind = message_count_before_bind + 1
                 WHERE entity_id = ?1 AND entity_type = ?2",
                params![entity_id, entity_type.as_str()],
            )?;
            let count: i64 = conn.query_row(
                "SELECT message_count_before_bind FROM conversations WHERE entity_id = ?1 AND entity_type = ?2",
                params![entity_id, entity_type.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    pub async fn record_message(&self, msg: &Message) -> Result<i64> {
        self.with_conn({
            let msg = msg.clone();
            move |conn| {
                conn.execute(
                    "INSERT INTO messages (entity_id, entity_type, direction, body, platform_message_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        msg.entity_id,
                        msg.entity_type.as_str(),
                        msg.direction.as_str(),
                        msg.body,
                        msg.platform_message_id,
                        msg.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        })
        .await
    }

    pub async fn get_ban(&self, entity_id: i64) -> Result<Option<Option<DateTime<Utc>>>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT until FROM bans WHERE entity_id = ?1")?;
            let row: Option<Option<String>> = stmt
                .query_row(params![entity_id], |row| row.get(0))
                .map(Some)
                .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })?;
            Ok(row.map(|until| until.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc)))))
        })
        .await
    }

    pub async fn set_ban(&self, entity_id: i64, until: Option<DateTime<Utc>>) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bans (entity_id, until) VALUES (?1, ?2)
                 ON CONFLICT(entity_id) DO UPDATE SET until = excluded.until",
                params![entity_id, until.map(|d| d.to_rfc3339())],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_ban(&self, entity_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM bans WHERE entity_id = ?1", params![entity_id])?;
            Ok(())
        })
        .await
    }

    pub async fn get_binding(&self, custom_id: &str) -> Result<Option<BindingId>> {
        let custom_id = custom_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT custom_id, password_hash, used, used_by_entity_id FROM binding_ids WHERE custom_id = ?1",
            )?;
            let row = stmt
                .query_row(params![custom_id], |row| {
                    Ok(BindingId {
                        custom_id: row.get(0)?,
                        password_hash: row.get(1)?,
                        used: row.get::<_, i64>(2)? != 0,
                        used_by_entity_id: row.get(3)?,
                    })
                })
                .map(Some)
                .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })?;
            Ok(row)
        })
        .await
    }

    pub async fn create_binding(&self, custom_id: &str, password_hash: Option<String>) -> Result<()> {
        let custom_id = custom_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO binding_ids (custom_id, password_hash, used, used_by_entity_id)
                 VALUES (?1, ?2, 0, NULL)",
                params![custom_id, password_hash],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_binding_used(&self, custom_id: &str, used_by_entity_id: i64) -> Result<()> {
        let custom_id = custom_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE binding_ids SET used = 1, used_by_entity_id = ?2 WHERE custom_id = ?1",
                params![custom_id, used_by_entity_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn record_failover_event(
        &self,
        event_id: &str,
        failed_bot_id: &str,
        reason: &str,
        target_bot_id: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<()> {
        let event_id = event_id.to_string();
        let failed_bot_id = failed_bot_id.to_string();
        let reason = reason.to_string();
        let target_bot_id = target_bot_id.map(|s| s.to_string());
        let metadata = metadata.map(|s| s.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO failover_events (event_id, failed_bot_id, reason, timestamp, target_bot_id, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![event_id, failed_bot_id, reason, Utc::now().to_rfc3339(), target_bot_id, metadata],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn stamp_recovery(&self, failed_bot_id: &str) -> Result<()> {
        let failed_bot_id = failed_bot_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE failover_events SET recovery_time = ?2
                 WHERE failed_bot_id = ?1 AND recovery_time IS NULL",
                params![failed_bot_id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    let entity_type: String = row.get(1)?;
    let status: String = row.get(3)?;
    let verification: String = row.get(7)?;
    let first_seen: String = row.get(9)?;
    Ok(Conversation {
        entity_id: row.get(0)?,
        entity_type: EntityType::from_str(&entity_type).unwrap_or(EntityType::User),
        topic_id: row.get(2)?,
        status: ConversationStatus::from_str(&status).unwrap_or(ConversationStatus::Open),
        lang: row.get(4)?,
        entity_name: row.get(5)?,
        custom_id: row.get(6)?,
        verification: Verification::from_str(&verification).unwrap_or(Verification::Pending),
        message_count_before_bind: row.get(8)?,
        first_seen: DateTime::parse_from_rfc3339(&first_seen)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_and_fetch_conversation() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db"), 2).await.unwrap();
        let conv = Conversation {
            entity_id: 555,
            entity_type: EntityType::User,
            topic_id: Some(42),
            status: ConversationStatus::Open,
            lang: None,
            entity_name: "A".to_string(),
            custom_id: None,
            verification: Verification::Pending,
            message_count_before_bind: 0,
            first_seen: Utc::now(),
        };
        store.create_conversation(&conv).await.unwrap();

        let fetched = store.get_conversation(555, EntityType::User).await.unwrap().unwrap();
        assert_eq!(fetched.entity_name, "A");
        assert_eq!(fetched.topic_id, Some(42));
    }

    #[tokio::test]
    async fn pre_bind_counter_increments() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db"), 2).await.unwrap();
        let conv = Conversation {
            entity_id: 1,
            entity_type: EntityType::User,
            topic_id: None,
            status: ConversationStatus::Open,
            lang: None,
            entity_name: "B".to_string(),
            custom_id: None,
            verification: Verification::Pending,
            message_count_before_bind: 0,
            first_seen: Utc::now(),
        };
        store.create_conversation(&conv).await.unwrap();
        let c1 = store.increment_pre_bind_count(1, EntityType::User).await.unwrap();
        let c2 = store.increment_pre_bind_count(1, EntityType::User).await.unwrap();
        assert_eq!(c1, 1);
        assert_eq!(c2, 2);
    }

    #[tokio::test]
    async fn ban_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db"), 2).await.unwrap();
        assert!(store.get_ban(9).await.unwrap().is_none());
        store.set_ban(9, None).await.unwrap();
        assert_eq!(store.get_ban(9).await.unwrap(), Some(None));
        store.delete_ban(9).await.unwrap();
        assert!(store.get_ban(9).await.unwrap().is_none());
    }
}
