//! # Quiver Queue
//!
//! A message queue broker on top of the Quiver store port.
//!
//! ## Features
//!
//! - **Queues**: FIFO, LIFO and priority queues, point-to-point or pub-sub
//!   with consumer groups
//! - **Atomic lifecycle**: publish, fetch, acknowledge and unacknowledge as
//!   single store scripts
//! - **Retries**: delayed retries, immediate requeues, dead-lettering with
//!   audit stores
//! - **Scheduling**: delayed, cron and repeating messages
//! - **Exchanges**: direct, topic and fanout routing
//! - **Maintenance**: promotion workers, an offline consumer reaper and
//!   background purge jobs on a single active worker cluster member
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quiver_queue::prelude::*;
//! use quiver_redis::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new()))?;
//!     let orders = QueueParams::new("shop", "orders")?;
//!     broker
//!         .queues()
//!         .create(&orders, QueueType::Fifo, DeliveryModel::PointToPoint)
//!         .await?;
//!
//!     broker
//!         .producer()
//!         .publish(MessageEnvelope::new(serde_json::json!({ "order": 42 })).to_queue(orders.clone()))
//!         .await?;
//!
//!     let consumer = broker.consumer();
//!     consumer
//!         .consume(orders, None, |message| async move {
//!             println!("got {}", message.payload);
//!             Ok(())
//!         })
//!         .await?;
//!     consumer.start().await?;
//!
//!     broker.workers().start().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod exchange;
pub mod keys;
pub mod lifecycle;
pub mod message;
pub mod message_manager;
pub mod producer;
pub mod queue;
pub mod scripts;
pub mod workers;

pub use broker::Broker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BrokerConfig, BrokerConfigBuilder, ConsumerConfig, JobConfig, MAX_HEARTBEAT_RETRIES,
    MAX_WORKER_BATCH_SIZE, MessageAuditConfig, WorkerConfig,
};
pub use consumer::{Consumer, MessageHandler};
pub use error::{ErrorCategory, QueueError, QueueResult};
pub use events::{BrokerEvent, EventBus};
pub use exchange::{Exchange, ExchangeRouter, ExchangeType};
pub use keys::QueueKeys;
pub use lifecycle::{Hook, Lifecycle, LifecycleState};
pub use message::{
    CronSchedule, DeadLetterReason, MessageEnvelope, MessagePriority, MessageSchedule,
    MessageState, MessageStatus, UnackAction, UnackReason,
};
pub use message_manager::{MessageListing, MessageManager, MessagePage};
pub use producer::Producer;
pub use queue::{
    DeliveryModel, QueueCounters, QueueParams, QueueProperties, QueueRegistry, QueueState,
    QueueType,
};
pub use workers::{
    JobWorker, PURGE_QUEUE_KIND, PurgePayload, PurgeProgress, PurgeRunner, PurgeScope, Worker,
    WorkerCluster,
};

/// Prelude for common imports.
///
/// ```
/// use quiver_queue::prelude::*;
/// ```
pub mod prelude {
    pub use crate::broker::Broker;
    pub use crate::config::BrokerConfig;
    pub use crate::consumer::Consumer;
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::events::BrokerEvent;
    pub use crate::exchange::ExchangeType;
    pub use crate::message::{MessageEnvelope, MessagePriority, MessageStatus};
    pub use crate::message_manager::MessageListing;
    pub use crate::queue::{DeliveryModel, QueueParams, QueueState, QueueType};
    pub use crate::workers::PurgeScope;
}
