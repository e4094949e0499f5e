use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;

use super::Kv;
use crate::error::{BridgeError, Result};

const COMPARE_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed `Kv`, using Lua scripts for anything that needs
/// read-modify-write in one round trip.
#[derive(Clone)]
pub struct RedisKv {
    connection: std::sync::Arc<Mutex<ConnectionManager>>,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| BridgeError::Kv(e.to_string()))?;
        let connection = client.get_tokio_connection_manager().await.map_err(|e| BridgeError::Kv(e.to_string()))?;
        Ok(Self { connection: std::sync::Arc::new(Mutex::new(connection)) })
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let result: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await
            .map(|v: Option<String>| v.is_some())
            .map_err(|e| BridgeError::Kv(e.to_string()))?;
        Ok(result)
    }

    async fn compare_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let deleted: i64 = Script::new(COMPARE_DELETE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| BridgeError::Kv(e.to_string()))?;
        Ok(deleted == 1)
    }

    async fn extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(expected)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| BridgeError::Kv(e.to_string()))?;
        Ok(extended == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.lock().await;
        conn.get(key).await.map_err(|e| BridgeError::Kv(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.lock().await;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.lock().await;
        let _: () = conn.del(key).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection.lock().await;
        let count: i64 = conn.incr(key, 1).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
        if count == 1 {
            let _: () = conn.expire(key, ttl.as_secs() as i64).await.map_err(|e| BridgeError::Kv(e.to_string()))?;
        }
        Ok(count)
    }
}
