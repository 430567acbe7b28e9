// Quiver - A Redis-backed message queue broker for Rust
//
// This library bundles the store port, the coordination primitives and the
// broker into one dependency.

// Re-export the store port
pub use quiver_redis::*;

// Re-export optional crates
#[cfg(feature = "distributed")]
pub use quiver_distributed;

#[cfg(feature = "queue")]
pub use quiver_queue;

// Prelude for common imports
pub mod prelude {
    pub use quiver_redis::prelude::*;

    #[cfg(feature = "distributed")]
    pub use quiver_distributed::{
        BackgroundJob, BackgroundJobManager, DistributedLock, JobError, JobStatus,
        LeaderElection,
    };

    #[cfg(feature = "queue")]
    pub use quiver_queue::prelude::*;

    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
    pub use serde_json;
    pub use tokio;
}
