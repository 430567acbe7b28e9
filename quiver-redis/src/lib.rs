//! # Quiver Redis
//!
//! The store port every Quiver component talks through.
//!
//! ## Features
//!
//! - **Key Scheme**: Deterministic, versioned key derivation
//! - **Atomic Scripts**: Named operations with a checked positional contract
//! - **Redis Backend**: bb8 connection pool, `EVALSHA`, `WATCH`/`MULTI`/`EXEC`
//! - **Memory Backend**: In-process keyspace with the same atomicity guarantees
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quiver_redis::{RedisConfig, RedisStore, Store};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::from_env().pool_size(8).build();
//!     let store = RedisStore::connect(config).await?;
//!     store.ping().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Scripts
//!
//! Every multi-key mutation is a [`Script`] with a Lua body for Redis and a
//! native body for [`MemoryStore`]. Operations implement [`ScriptCall`] and
//! run through [`StoreExt::call`], which rejects calls that break the
//! script's key/argument layout before anything reaches the server.

mod config;
mod error;
mod keys;
pub mod memory;
mod pool;
mod redis_store;
mod script;
mod store;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{StoreError, StoreResult};
pub use keys::{GLOBAL_NAMESPACE, InvalidKeyName, KeyScheme, KeyType, ParsedKey, validate_name};
pub use memory::{Keyspace, MemoryStore};
pub use pool::{RedisPool, RedisPoolBuilder};
pub use redis_store::RedisStore;
pub use script::{Arity, NativeScript, Reply, Script, ScriptCall};
pub use store::{Store, StoreExt, TxOp, Watch};

// Re-export redis crate for convenience
pub use redis;

/// Prelude for common imports.
///
/// ```
/// use quiver_redis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{StoreError, StoreResult};
    pub use crate::keys::{KeyScheme, KeyType};
    pub use crate::memory::MemoryStore;
    pub use crate::redis_store::RedisStore;
    pub use crate::script::{Reply, Script, ScriptCall};
    pub use crate::store::{Store, StoreExt, TxOp, Watch};
}
