//! Redis store backend

use super::{StoreBackend, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// Redis-backed store using a multiplexed connection manager.
///
/// The manager reconnects on its own; individual command failures surface as
/// errors so the composite store can degrade.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect eagerly so a bad URL is reported at startup.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut con = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut con = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut con = self.conn.clone();
        // SET NX returns OK on success, nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut con = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut con).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut con = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut con)
            .await?;
        Ok(keys)
    }
}
