//! Distributed coordination for Quiver
//!
//! This crate provides the coordination primitives the broker's
//! maintenance side is built on.
//!
//! ## Features
//!
//! - **Distributed Locks** - TTL locks with retry, extension and token-checked release
//! - **Leader Election** - One active instance per role; losers stay idle
//! - **Background Jobs** - Job lifecycle, target locking, stuck-job recovery
//! - **Batch Runner** - Cooperative cancellation between batches
//!
//! ## Quick Start
//!
//! ```rust
//! use quiver_distributed::*;
//! use quiver_redis::{KeyScheme, MemoryStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! let jobs = BackgroundJobManager::new(store, KeyScheme::default(), Duration::from_secs(60));
//!
//! let job = jobs.create("purge-queue", "orders@billing", serde_json::json!({})).await?;
//! jobs.start(&job.id).await?;
//! let job = jobs.complete(&job.id, serde_json::json!({ "total_purged": 0 })).await?;
//! assert_eq!(job.status, JobStatus::Completed);
//! # Ok::<(), JobError>(())
//! # }).unwrap();
//! ```

pub mod error;
pub mod jobs;
pub mod leader;
pub mod lock;

pub use error::{JobError, JobResult, LockError, LockResult};
pub use jobs::{
    BackgroundJob, BackgroundJobManager, BatchJob, BatchStep, JobRunner, JobStatus, run_batch_job,
};
pub use leader::{LeaderElection, LeaderElectionBuilder};
pub use lock::{DistributedLock, LockBuilder, LockGuard};
