//! In-process store backend.
//!
//! [`MemoryStore`] keeps a single [`Keyspace`] behind a mutex. Scripts run
//! their native body while holding the lock, so every script call is
//! all-or-nothing with respect to every other caller, exactly as a Lua
//! script is on a Redis server.

mod keyspace;

pub use keyspace::Keyspace;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreResult;
use crate::script::{Reply, Script};
use crate::store::{Store, TxOp, Watch};

/// Store backed by process memory.
///
/// ```rust
/// use quiver_redis::{MemoryStore, Store};
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// assert!(store.set_nx_px("lock", "a", 1_000).await?);
/// assert!(!store.set_nx_px("lock", "b", 1_000).await?);
/// assert_eq!(store.get("lock").await?.as_deref(), Some("a"));
/// # Ok::<(), quiver_redis::StoreError>(())
/// # }).unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Keyspace>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure against the keyspace under the lock.
    pub fn with_keyspace<R>(&self, f: impl FnOnce(&mut Keyspace) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn eval(
        &self,
        script: &'static Script,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Reply> {
        let mut ks = self.inner.lock();
        (script.native)(&mut ks, keys, args)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.lock().get(key)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.lock().set(key, value);
        Ok(())
    }

    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<()> {
        self.inner.lock().set_px(key, value, ttl_ms);
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        Ok(self.inner.lock().set_nx_px(key, value, ttl_ms))
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let mut ks = self.inner.lock();
        Ok(keys.iter().filter(|k| ks.del(k)).count() as u64)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().exists(key))
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool> {
        Ok(self.inner.lock().pexpire(key, ttl_ms))
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.inner.lock().hget(key, field)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.lock().hgetall(key)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.inner.lock().hset(key, field, value)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.inner.lock().hdel(key, field)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.lock().smembers(key)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.lock().sismember(key, member)
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        self.inner.lock().scard(key)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.inner.lock().zrange(key, start, stop)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
        offset: u64,
        count: u64,
    ) -> StoreResult<Vec<String>> {
        self.inner.lock().zrangebyscore(key, min, max, offset, count)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.inner.lock().zcard(key)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.inner.lock().lrange(key, start, stop)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.inner.lock().llen(key)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.inner.lock().keys_with_prefix(prefix))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn watch(&self, keys: &[String]) -> StoreResult<Box<dyn Watch>> {
        let mut ks = self.inner.lock();
        let versions = keys.iter().map(|k| (k.clone(), ks.version(k))).collect();
        Ok(Box::new(MemoryWatch {
            inner: Arc::clone(&self.inner),
            versions,
        }))
    }
}

/// Watch session over a [`MemoryStore`].
struct MemoryWatch {
    inner: Arc<Mutex<Keyspace>>,
    versions: Vec<(String, u64)>,
}

#[async_trait]
impl Watch for MemoryWatch {
    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.inner.lock().get(key)
    }

    async fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.inner.lock().hget(key, field)
    }

    async fn hgetall(&mut self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.lock().hgetall(key)
    }

    async fn smembers(&mut self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.lock().smembers(key)
    }

    async fn scard(&mut self, key: &str) -> StoreResult<u64> {
        self.inner.lock().scard(key)
    }

    async fn exists(&mut self, key: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().exists(key))
    }

    async fn exec(self: Box<Self>, ops: Vec<TxOp>) -> StoreResult<bool> {
        let mut ks = self.inner.lock();
        for (key, version) in &self.versions {
            if ks.version(key) != *version {
                debug!(key = %key, "watched key changed, aborting transaction");
                return Ok(false);
            }
        }
        for op in ops {
            match op {
                TxOp::Set { key, value } => ks.set(&key, &value),
                TxOp::Del { key } => {
                    ks.del(&key);
                }
                TxOp::HSet { key, field, value } => ks.hset(&key, &field, &value)?,
                TxOp::HDel { key, field } => {
                    ks.hdel(&key, &field)?;
                }
                TxOp::SAdd { key, member } => {
                    ks.sadd(&key, &member)?;
                }
                TxOp::SRem { key, member } => {
                    ks.srem(&key, &member)?;
                }
            }
        }
        Ok(true)
    }

    async fn discard(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_commits_when_untouched() {
        let store = MemoryStore::new();
        let keys = vec!["a".to_string()];
        let mut session = store.watch(&keys).await.unwrap();
        assert_eq!(session.get("a").await.unwrap(), None);
        let ok = session
            .exec(vec![TxOp::Set {
                key: "a".into(),
                value: "1".into(),
            }])
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_watch_aborts_on_concurrent_write() {
        let store = MemoryStore::new();
        let keys = vec!["s".to_string()];
        let session = store.watch(&keys).await.unwrap();
        store.with_keyspace(|ks| ks.sadd("s", "intruder")).unwrap();
        let ok = session
            .exec(vec![TxOp::SAdd {
                key: "s".into(),
                member: "mine".into(),
            }])
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(store.smembers("s").await.unwrap(), vec!["intruder"]);
    }

    #[tokio::test]
    async fn test_del_counts_existing_keys() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        let removed = store
            .del(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
