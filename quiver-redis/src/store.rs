//! The store port.
//!
//! Every component talks to the keyspace through [`Store`]. Multi-key
//! mutations go through [`Store::eval`] with a [`Script`]; read-decide-write
//! sequences that cannot be expressed as one fixed-arity call open a
//! [`Watch`] session and commit with optimistic concurrency.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::trace;

use crate::error::StoreResult;
use crate::script::{Reply, Script, ScriptCall};

/// Mutation queued inside a [`Watch`] session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    /// `SET key value`.
    Set { key: String, value: String },
    /// `DEL key`.
    Del { key: String },
    /// `HSET key field value`.
    HSet {
        key: String,
        field: String,
        value: String,
    },
    /// `HDEL key field`.
    HDel { key: String, field: String },
    /// `SADD key member`.
    SAdd { key: String, member: String },
    /// `SREM key member`.
    SRem { key: String, member: String },
}

/// Optimistic transaction session.
///
/// Reads go through the session; [`Watch::exec`] applies the queued
/// operations only if none of the watched keys changed since the session
/// was opened, and returns `false` otherwise.
#[async_trait]
pub trait Watch: Send {
    /// Read a string value.
    async fn get(&mut self, key: &str) -> StoreResult<Option<String>>;

    /// Read a hash field.
    async fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Read a whole hash.
    async fn hgetall(&mut self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Read set members.
    async fn smembers(&mut self, key: &str) -> StoreResult<Vec<String>>;

    /// Read set cardinality.
    async fn scard(&mut self, key: &str) -> StoreResult<u64>;

    /// Check key existence.
    async fn exists(&mut self, key: &str) -> StoreResult<bool>;

    /// Commit. `Ok(false)` means a watched key changed and nothing was applied.
    async fn exec(self: Box<Self>, ops: Vec<TxOp>) -> StoreResult<bool>;

    /// Abandon the session.
    async fn discard(self: Box<Self>) -> StoreResult<()>;
}

/// Store backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run an atomic script. Callers should prefer [`StoreExt::call`].
    async fn eval(&self, script: &'static Script, keys: &[String], args: &[String])
    -> StoreResult<Reply>;

    /// `GET`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// `SET`.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// `SET key value PX ttl`.
    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<()>;

    /// `SET key value NX PX ttl`. Returns `true` if the key was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool>;

    /// `DEL`. Returns the number of removed keys.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// `EXISTS`.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// `PEXPIRE`. Returns `false` if the key does not exist.
    async fn pexpire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool>;

    /// `HGET`.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// `HGETALL`.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// `HSET` of one field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// `HDEL` of one field.
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// `SMEMBERS`, sorted.
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// `SISMEMBER`.
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// `SCARD`.
    async fn scard(&self, key: &str) -> StoreResult<u64>;

    /// `ZRANGE key start stop`.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// `ZRANGEBYSCORE key min max LIMIT offset count`.
    ///
    /// `i64::MIN` and `i64::MAX` stand for `-inf` and `+inf`.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
        offset: u64,
        count: u64,
    ) -> StoreResult<Vec<String>>;

    /// `ZCARD`.
    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// `LRANGE`.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// `LLEN`.
    async fn llen(&self, key: &str) -> StoreResult<u64>;

    /// All keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Health check.
    async fn ping(&self) -> StoreResult<()>;

    /// Open an optimistic session watching `keys`.
    async fn watch(&self, keys: &[String]) -> StoreResult<Box<dyn Watch>>;
}

/// Typed script invocation for all stores.
#[async_trait]
pub trait StoreExt: Store {
    /// Check the call's layout against its script contract, run it and
    /// parse the reply.
    async fn call<C>(&self, call: &C) -> Result<C::Output, C::Error>
    where
        C: ScriptCall + Sync,
        C::Output: Send,
        C::Error: Send,
    {
        let script = call.script();
        let keys = call.keys();
        let args = call.args();
        script.check(&keys, &args)?;
        trace!(script = script.name, keys = keys.len(), args = args.len(), "eval");
        let reply = self.eval(script, &keys, &args).await?;
        call.parse(reply)
    }
}

impl<T: Store + ?Sized> StoreExt for T {}
