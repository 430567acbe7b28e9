//! Redis store backend.

use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};
use crate::pool::{RedisPool, RedisPoolBuilder};
use crate::script::{Reply, Script};
use crate::store::{Store, TxOp, Watch};
use crate::RedisConfig;

/// Store backed by a Redis server.
///
/// Scripts are sent with `EVALSHA` and loaded on demand; optimistic
/// sessions hold a dedicated pooled connection for `WATCH`/`MULTI`/`EXEC`.
pub struct RedisStore {
    pool: RedisPool,
    scripts: Mutex<HashMap<&'static str, redis::Script>>,
}

impl RedisStore {
    /// Connect using the given configuration.
    pub async fn connect(config: RedisConfig) -> StoreResult<Self> {
        let pool = RedisPoolBuilder::new(config).build().await?;
        Ok(Self::from_pool(pool))
    }

    /// Create from an existing pool.
    pub fn from_pool(pool: RedisPool) -> Self {
        Self {
            pool,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    fn script(&self, script: &'static Script) -> redis::Script {
        self.scripts
            .lock()
            .entry(script.name)
            .or_insert_with(|| redis::Script::new(script.lua))
            .clone()
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> StoreResult<T> {
        let mut conn = self.pool.get().await?;
        Ok(cmd.query_async(&mut *conn).await?)
    }
}

/// Render a score bound, mapping the integer extremes to infinities.
fn score_bound(score: i64) -> String {
    match score {
        i64::MIN => "-inf".to_string(),
        i64::MAX => "+inf".to_string(),
        n => n.to_string(),
    }
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl Store for RedisStore {
    async fn eval(
        &self,
        script: &'static Script,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Reply> {
        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .script(script)
            .key(keys)
            .arg(args)
            .invoke_async(&mut *conn)
            .await?;
        trace!(script = script.name, "script executed");
        Reply::from_redis(value)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.query(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<()> {
        self.query(redis::cmd("SET").arg(key).arg(value).arg("PX").arg(ttl_ms))
            .await
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(keys)).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.query(redis::cmd("EXISTS").arg(key)).await
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool> {
        self.query(redis::cmd("PEXPIRE").arg(key).arg(ttl_ms)).await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let _: i64 = self
            .query(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.query(redis::cmd("HDEL").arg(key).arg(field)).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut members: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(key)).await?;
        members.sort();
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.query(redis::cmd("SISMEMBER").arg(key).arg(member))
            .await
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("SCARD").arg(key)).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("ZRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
        offset: u64,
        count: u64,
    ) -> StoreResult<Vec<String>> {
        self.query(
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(score_bound(min))
                .arg(score_bound(max))
                .arg("LIMIT")
                .arg(offset)
                .arg(count),
        )
        .await
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("ZCARD").arg(key)).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("LLEN").arg(key)).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut *conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let _: String = self
            .query(&redis::cmd("PING"))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn watch(&self, keys: &[String]) -> StoreResult<Box<dyn Watch>> {
        let mut conn = self.pool.get_owned().await?;
        // a session dropped without exec/discard leaves its WATCH behind
        let _: () = redis::cmd("UNWATCH").query_async(&mut *conn).await?;
        if !keys.is_empty() {
            let _: () = redis::cmd("WATCH").arg(keys).query_async(&mut *conn).await?;
        }
        Ok(Box::new(RedisWatch { conn }))
    }
}

/// Watch session on a dedicated pooled connection.
struct RedisWatch {
    conn: PooledConnection<'static, RedisConnectionManager>,
}

impl RedisWatch {
    async fn query<T: redis::FromRedisValue>(&mut self, cmd: &redis::Cmd) -> StoreResult<T> {
        Ok(cmd.query_async(&mut *self.conn).await?)
    }
}

#[async_trait]
impl Watch for RedisWatch {
    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hgetall(&mut self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn smembers(&mut self, key: &str) -> StoreResult<Vec<String>> {
        let mut members: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(key)).await?;
        members.sort();
        Ok(members)
    }

    async fn scard(&mut self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("SCARD").arg(key)).await
    }

    async fn exists(&mut self, key: &str) -> StoreResult<bool> {
        self.query(redis::cmd("EXISTS").arg(key)).await
    }

    async fn exec(mut self: Box<Self>, ops: Vec<TxOp>) -> StoreResult<bool> {
        if ops.is_empty() {
            self.discard().await?;
            return Ok(true);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                TxOp::Set { key, value } => pipe.cmd("SET").arg(key).arg(value).ignore(),
                TxOp::Del { key } => pipe.cmd("DEL").arg(key).ignore(),
                TxOp::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore()
                }
                TxOp::HDel { key, field } => pipe.cmd("HDEL").arg(key).arg(field).ignore(),
                TxOp::SAdd { key, member } => pipe.cmd("SADD").arg(key).arg(member).ignore(),
                TxOp::SRem { key, member } => pipe.cmd("SREM").arg(key).arg(member).ignore(),
            };
        }
        let result: redis::Value = pipe.query_async(&mut *self.conn).await?;
        let committed = !matches!(result, redis::Value::Nil);
        if !committed {
            debug!("transaction aborted by a concurrent write");
        }
        Ok(committed)
    }

    async fn discard(mut self: Box<Self>) -> StoreResult<()> {
        let _: () = redis::cmd("UNWATCH").query_async(&mut *self.conn).await?;
        Ok(())
    }
}
