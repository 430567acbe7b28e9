//! Single-active-instance election.
//!
//! Several processes may run the same role (a worker cluster, a job
//! worker); exactly one of them should be active. The role is a lock whose
//! token is the node id. Losers are not failures: they report `false` and
//! stay idle.

use quiver_redis::Store;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LockError, LockResult};
use crate::lock::DistributedLock;

/// Lock-backed election for one role.
pub struct LeaderElection {
    lock: DistributedLock,
    node_id: String,
    is_leader: AtomicBool,
}

impl LeaderElection {
    /// Create an election for the role guarded by `key`.
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            lock: DistributedLock::new(store, key, ttl),
            node_id: Uuid::new_v4().to_string(),
            is_leader: AtomicBool::new(false),
        }
    }

    /// Create a builder.
    pub fn builder(key: impl Into<String>) -> LeaderElectionBuilder {
        LeaderElectionBuilder::new(key)
    }

    /// Check if this node holds the role.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Get the node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Interval at which a leader should renew (a third of the TTL).
    pub fn refresh_interval(&self) -> Duration {
        self.lock.ttl() / 3
    }

    /// Try to take the role. Returns `false` when another node holds it.
    pub async fn try_elect(&self) -> LockResult<bool> {
        match self.lock.claim(self.node_id.as_str()).await {
            Ok(_) => {
                if !self.is_leader.swap(true, Ordering::AcqRel) {
                    info!(key = %self.lock.key(), node = %self.node_id, "elected");
                }
                Ok(true)
            }
            Err(LockError::AlreadyLocked(_)) => {
                debug!(key = %self.lock.key(), node = %self.node_id, "another node is active");
                self.is_leader.store(false, Ordering::Release);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Keep the role alive. Returns `false` if it was lost.
    pub async fn renew(&self) -> LockResult<bool> {
        match self.lock.extend(&self.node_id).await {
            Ok(()) => Ok(true),
            Err(LockError::NotHeld(_)) => {
                if self.is_leader.swap(false, Ordering::AcqRel) {
                    warn!(key = %self.lock.key(), node = %self.node_id, "lost leadership");
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Give up the role.
    pub async fn resign(&self) -> LockResult<()> {
        if !self.is_leader.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        match self.lock.release(&self.node_id).await {
            Ok(()) | Err(LockError::NotHeld(_)) => {
                info!(node = %self.node_id, "resigned from leadership");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Node id of the current holder.
    pub async fn leader(&self) -> LockResult<Option<String>> {
        self.lock.owner().await
    }
}

/// Leader election builder.
pub struct LeaderElectionBuilder {
    key: String,
    ttl: Duration,
}

impl LeaderElectionBuilder {
    /// Create new builder.
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

    /// Build the election.
    pub fn build(self, store: Arc<dyn Store>) -> LeaderElection {
        LeaderElection::new(store, self.key, self.ttl)
    }
}
