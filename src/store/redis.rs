//! Redis-backed `KvStore`.
//!
//! Compare-ops (`del_if_value`, `zswap`) run as Lua scripts so they stay
//! atomic against concurrent workers; everything else maps one-to-one onto
//! Redis commands. All keys are prefixed with the configured namespace.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::time::Duration;

use super::KvStore;
use crate::config::StoreConfig;
use crate::error::Result;

const DEL_IF_VALUE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const ZSWAP: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
    return 1
else
    return 0
end
"#;

pub struct RedisStore {
    conn: MultiplexedConnection,
    namespace: String,
    del_if_value: Script,
    zswap: Script,
}

impl RedisStore {
    /// Connect using the configured URL and namespace.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::new(conn, config.namespace.clone()))
    }

    pub fn new(conn: MultiplexedConnection, namespace: String) -> Self {
        Self {
            conn,
            namespace,
            del_if_value: Script::new(DEL_IF_VALUE),
            zswap: Script::new(ZSWAP),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.key(key)).await?)
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .del_if_value
            .key(self.key(key))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.key(key), member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(self.key(key), member).await?;
        Ok(removed == 1)
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let rank: Option<i64> = conn.zrank(self.key(key), member).await?;
        Ok(rank.map(|r| r as u64))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        Ok(conn
            .zrangebyscore_withscores(self.key(key), min, max)
            .await?)
    }

    async fn zmembers(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange_withscores(self.key(key), 0, -1).await?)
    }

    async fn zswap(
        &self,
        key: &str,
        old_member: &str,
        new_member: &str,
        score: f64,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .zswap
            .key(self.key(key))
            .arg(old_member)
            .arg(score)
            .arg(new_member)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn queue_push(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.key(queue), payload).await?;
        Ok(())
    }

    async fn queue_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .blpop(self.key(queue), timeout.as_secs_f64())
            .await?;
        Ok(popped.map(|(_, payload)| payload))
    }
}
