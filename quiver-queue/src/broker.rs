//! Broker handle.
//!
//! A [`Broker`] owns the configuration, the store and the event bus. Every
//! component is created from it and shares one [`BrokerContext`].

use quiver_distributed::{BackgroundJob, BackgroundJobManager};
use quiver_redis::Store;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::BrokerConfig;
use crate::consumer::Consumer;
use crate::error::{QueueError, QueueResult};
use crate::events::{BrokerEvent, EventBus};
use crate::exchange::ExchangeRouter;
use crate::keys::QueueKeys;
use crate::message_manager::MessageManager;
use crate::producer::Producer;
use crate::queue::{QueueParams, QueueRegistry};
use crate::workers::{PURGE_QUEUE_KIND, PurgePayload, PurgeScope, WorkerCluster};

/// Attempts of an optimistic transaction before giving up.
pub(crate) const MAX_WATCH_ATTEMPTS: usize = 5;

/// State shared by every component of one broker.
pub(crate) struct BrokerContext {
    pub config: BrokerConfig,
    pub store: Arc<dyn Store>,
    pub keys: QueueKeys,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
}

impl BrokerContext {
    /// Current time in epoch milliseconds.
    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn jobs(&self) -> BackgroundJobManager {
        BackgroundJobManager::new(
            Arc::clone(&self.store),
            self.config.keys.clone(),
            self.config.jobs.lock_ttl,
        )
    }
}

/// Entry point to a message broker.
///
/// # Examples
///
/// ```rust
/// use quiver_queue::prelude::*;
/// use quiver_redis::MemoryStore;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new()))?;
/// let orders = QueueParams::new("shop", "orders")?;
/// broker
///     .queues()
///     .create(&orders, QueueType::Fifo, DeliveryModel::PointToPoint)
///     .await?;
///
/// let message = MessageEnvelope::new(serde_json::json!({ "order": 42 })).to_queue(orders);
/// let ids = broker.producer().publish(message).await?;
/// assert_eq!(ids.len(), 1);
/// # Ok::<(), QueueError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct Broker {
    ctx: Arc<BrokerContext>,
}

impl Broker {
    /// Create a broker on the system clock.
    pub fn new(config: BrokerConfig, store: Arc<dyn Store>) -> QueueResult<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a broker reading time from `clock`.
    pub fn with_clock(
        config: BrokerConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        config.validate()?;
        let keys = QueueKeys::new(config.keys.clone());
        let events = EventBus::new(config.event_capacity);
        info!(namespace = %config.namespace, prefix = %config.keys.prefix, "broker created");
        Ok(Self {
            ctx: Arc::new(BrokerContext {
                config,
                store,
                keys,
                clock,
                events,
            }),
        })
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    /// The underlying store.
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.ctx.store)
    }

    /// Key derivation for this broker.
    pub fn keys(&self) -> &QueueKeys {
        &self.ctx.keys
    }

    /// Queue administration.
    pub fn queues(&self) -> QueueRegistry {
        QueueRegistry::new(Arc::clone(&self.ctx))
    }

    /// Publishing.
    pub fn producer(&self) -> Producer {
        Producer::new(Arc::clone(&self.ctx))
    }

    /// Message inspection, deletion and requeue.
    pub fn messages(&self) -> MessageManager {
        MessageManager::new(Arc::clone(&self.ctx))
    }

    /// Exchanges and bindings.
    pub fn exchanges(&self) -> ExchangeRouter {
        ExchangeRouter::new(Arc::clone(&self.ctx))
    }

    /// Background jobs.
    pub fn jobs(&self) -> BackgroundJobManager {
        self.ctx.jobs()
    }

    /// A new consumer with a fresh id.
    pub fn consumer(&self) -> Consumer {
        Consumer::new(Arc::clone(&self.ctx))
    }

    /// The maintenance worker cluster member of this process.
    pub fn workers(&self) -> WorkerCluster {
        WorkerCluster::new(Arc::clone(&self.ctx))
    }

    /// Subscribe to broker events.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.ctx.events.subscribe()
    }

    /// Schedule a purge of `queue`.
    ///
    /// The job runs on the worker cluster; only one job per queue can be
    /// active at a time.
    pub async fn purge_queue(&self, queue: &QueueParams, scope: PurgeScope) -> QueueResult<BackgroundJob> {
        if !self.queues().exists(queue).await? {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        let payload = PurgePayload {
            queue: queue.clone(),
            scope,
            batch_size: self.ctx.config.jobs.purge_batch_size,
            batch_delay_ms: self.ctx.config.jobs.batch_delay.as_millis() as u64,
        };
        let job = self
            .jobs()
            .create(PURGE_QUEUE_KIND, &queue.to_string(), serde_json::to_value(&payload)?)
            .await?;
        self.ctx.events.emit(BrokerEvent::JobStatusChanged {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            status: job.status,
        });
        Ok(job)
    }

    pub(crate) fn context(&self) -> &Arc<BrokerContext> {
        &self.ctx
    }
}
