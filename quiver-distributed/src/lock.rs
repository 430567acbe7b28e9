//! Distributed locks over the store.
//!
//! A lock is a string key holding the owner's token with a TTL. Acquisition
//! is `SET NX PX`; extension and release are token-checked scripts so a
//! holder whose lock expired can never touch its successor's lock.

use quiver_redis::{Arity, Keyspace, Reply, Script, ScriptCall, Store, StoreExt, StoreResult};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LockError, LockResult};

fn release_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    if ks.get(&keys[0])?.as_deref() == Some(args[0].as_str()) {
        ks.del(&keys[0]);
        Ok(Reply::Int(1))
    } else {
        Ok(Reply::Int(0))
    }
}

fn extend_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let ttl_ms = parse_ttl(&args[1])?;
    if ks.get(&keys[0])?.as_deref() == Some(args[0].as_str()) {
        ks.pexpire(&keys[0], ttl_ms);
        Ok(Reply::Int(1))
    } else {
        Ok(Reply::Int(0))
    }
}

fn claim_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let ttl_ms = parse_ttl(&args[1])?;
    match ks.get(&keys[0])? {
        Some(current) if current != args[0] => Ok(Reply::Int(0)),
        _ => {
            ks.set_px(&keys[0], &args[0], ttl_ms);
            Ok(Reply::Int(1))
        }
    }
}

fn parse_ttl(raw: &str) -> StoreResult<u64> {
    raw.parse()
        .map_err(|_| quiver_redis::StoreError::contract(format!("invalid ttl '{}'", raw)))
}

/// KEYS: lock. ARGV: token.
pub static RELEASE_LOCK: Script = Script {
    name: "release-lock",
    lua: r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
    native: release_native,
    keys: Arity::Fixed(1),
    args: Arity::Fixed(1),
};

/// KEYS: lock. ARGV: token, ttl ms.
pub static EXTEND_LOCK: Script = Script {
    name: "extend-lock",
    lua: r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#,
    native: extend_native,
    keys: Arity::Fixed(1),
    args: Arity::Fixed(2),
};

/// Acquire, or refresh when the caller already owns the lock.
///
/// KEYS: lock. ARGV: token, ttl ms.
pub static CLAIM_LOCK: Script = Script {
    name: "claim-lock",
    lua: r#"
local current = redis.call('GET', KEYS[1])
if current == false or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
"#,
    native: claim_native,
    keys: Arity::Fixed(1),
    args: Arity::Fixed(2),
};

/// One token-checked lock operation.
struct TokenCall<'a> {
    script: &'static Script,
    key: &'a str,
    token: &'a str,
    ttl: Option<Duration>,
}

impl ScriptCall for TokenCall<'_> {
    type Output = bool;
    type Error = LockError;

    fn script(&self) -> &'static Script {
        self.script
    }

    fn keys(&self) -> Vec<String> {
        vec![self.key.to_string()]
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![self.token.to_string()];
        if let Some(ttl) = self.ttl {
            args.push(ttl.as_millis().to_string());
        }
        args
    }

    fn parse(&self, reply: Reply) -> LockResult<bool> {
        Ok(reply.into_int()? == 1)
    }
}

/// A held lock.
///
/// The lock outlives the guard unless it is released explicitly; the TTL
/// bounds how long a crashed holder blocks others.
#[derive(Debug, Clone)]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    /// Lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Store-backed distributed lock.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn Store>,
    key: String,
    ttl: Duration,
}

impl DistributedLock {
    /// Create a lock on `key`.
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    /// Get the lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the lock TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire with a random token.
    pub async fn acquire(&self) -> LockResult<LockGuard> {
        self.acquire_with_token(Uuid::new_v4().to_string()).await
    }

    /// Acquire with a caller-chosen token.
    ///
    /// Fails with [`LockError::AlreadyLocked`] if any holder, including one
    /// with the same token, owns the lock.
    pub async fn acquire_with_token(&self, token: impl Into<String>) -> LockResult<LockGuard> {
        let token = token.into();
        let ttl_ms = self.ttl.as_millis() as u64;
        if self.store.set_nx_px(&self.key, &token, ttl_ms).await? {
            debug!(key = %self.key, "acquired lock");
            Ok(LockGuard {
                key: self.key.clone(),
                token,
            })
        } else {
            Err(LockError::AlreadyLocked(self.key.clone()))
        }
    }

    /// Acquire, or refresh the TTL if `token` already owns the lock.
    pub async fn claim(&self, token: impl Into<String>) -> LockResult<LockGuard> {
        let token = token.into();
        let claimed = self
            .store
            .call(&TokenCall {
                script: &CLAIM_LOCK,
                key: &self.key,
                token: &token,
                ttl: Some(self.ttl),
            })
            .await?;
        if claimed {
            Ok(LockGuard {
                key: self.key.clone(),
                token,
            })
        } else {
            Err(LockError::AlreadyLocked(self.key.clone()))
        }
    }

    /// Retry acquisition up to `attempts` times, sleeping `interval` plus a
    /// small jitter between tries.
    pub async fn acquire_with_retry(
        &self,
        attempts: u32,
        interval: Duration,
    ) -> LockResult<LockGuard> {
        for attempt in 1..=attempts.max(1) {
            match self.acquire().await {
                Ok(guard) => return Ok(guard),
                Err(LockError::AlreadyLocked(_)) if attempt < attempts => {
                    let jitter = rand::rng().random_range(0..=interval.as_millis() as u64 / 10);
                    tokio::time::sleep(interval + Duration::from_millis(jitter)).await;
                }
                Err(LockError::AlreadyLocked(_)) => break,
                Err(e) => return Err(e),
            }
        }
        debug!(key = %self.key, attempts, "lock retries exhausted");
        Err(LockError::Timeout)
    }

    /// Reset the TTL of a lock owned by `token`.
    pub async fn extend(&self, token: &str) -> LockResult<()> {
        let extended = self
            .store
            .call(&TokenCall {
                script: &EXTEND_LOCK,
                key: &self.key,
                token,
                ttl: Some(self.ttl),
            })
            .await?;
        if extended {
            Ok(())
        } else {
            Err(LockError::NotHeld(self.key.clone()))
        }
    }

    /// Release a lock owned by `token`.
    pub async fn release(&self, token: &str) -> LockResult<()> {
        let released = self
            .store
            .call(&TokenCall {
                script: &RELEASE_LOCK,
                key: &self.key,
                token,
                ttl: None,
            })
            .await?;
        if released {
            debug!(key = %self.key, "released lock");
            Ok(())
        } else {
            warn!(key = %self.key, "failed to release lock (not held or expired)");
            Err(LockError::NotHeld(self.key.clone()))
        }
    }

    /// Release the lock held by a guard.
    pub async fn release_guard(&self, guard: LockGuard) -> LockResult<()> {
        self.release(&guard.token).await
    }

    /// Check if anyone holds the lock.
    pub async fn is_locked(&self) -> LockResult<bool> {
        Ok(self.store.exists(&self.key).await?)
    }

    /// Token of the current holder.
    pub async fn owner(&self) -> LockResult<Option<String>> {
        Ok(self.store.get(&self.key).await?)
    }
}

/// Distributed lock builder.
pub struct LockBuilder {
    key: String,
    ttl: Duration,
}

impl LockBuilder {
    /// Create a new lock builder.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: Duration::from_secs(30),
        }
    }

    /// Set TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Build the lock.
    pub fn build(self, store: Arc<dyn Store>) -> DistributedLock {
        info!(key = %self.key, ttl_ms = self.ttl.as_millis() as u64, "lock configured");
        DistributedLock::new(store, self.key, self.ttl)
    }
}
