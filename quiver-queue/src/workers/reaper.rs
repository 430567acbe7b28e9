//! Offline consumer reaper.
//!
//! A consumer that stopped writing its heartbeat still owns the messages
//! in its processing lists. The reaper hands them back with
//! `OFFLINE_CONSUMER` and drops the consumer from the processing registry.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::Worker;
use crate::broker::BrokerContext;
use crate::consumer::{is_alive, release_processing};
use crate::error::QueueResult;
use crate::events::BrokerEvent;
use crate::message::UnackReason;
use crate::queue::QueueRegistry;

/// Releases messages held by consumers without a live heartbeat.
pub(crate) struct ConsumerReaper {
    ctx: Arc<BrokerContext>,
}

impl ConsumerReaper {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Worker for ConsumerReaper {
    fn name(&self) -> &str {
        "reaper"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.workers.reaper_interval
    }

    async fn tick(&self) -> QueueResult<usize> {
        let mut offline = BTreeSet::new();
        let mut released = 0;
        for queue in QueueRegistry::new(Arc::clone(&self.ctx)).list().await? {
            let registry = self.ctx.keys.processing_registry(&queue);
            let mut consumers: Vec<String> =
                self.ctx.store.hgetall(&registry).await?.into_keys().collect();
            consumers.sort();
            for consumer_id in consumers {
                if is_alive(&self.ctx, &consumer_id).await? {
                    continue;
                }
                released += release_processing(
                    &self.ctx,
                    &queue,
                    &consumer_id,
                    UnackReason::OfflineConsumer,
                    None,
                )
                .await?;
                self.ctx.store.hdel(&registry, &consumer_id).await?;
                offline.insert(consumer_id);
            }
        }
        for consumer_id in offline {
            info!(consumer_id = %consumer_id, "reaped offline consumer");
            self.ctx.events.emit(BrokerEvent::ConsumerDown { consumer_id });
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::message::{MessageEnvelope, MessageStatus};
    use crate::queue::{DeliveryModel, QueueParams, QueueType};
    use crate::scripts::FetchForProcessing;
    use quiver_redis::{MemoryStore, StoreExt};

    #[tokio::test]
    async fn test_releases_messages_of_offline_consumers() {
        let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        let queue = QueueParams::new("test", "orders").unwrap();
        broker
            .queues()
            .create(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
            .await
            .unwrap();
        broker
            .producer()
            .publish(
                MessageEnvelope::new(serde_json::json!(1))
                    .with_id("m")
                    .to_queue(queue.clone())
                    .with_retry_delay(Duration::ZERO),
            )
            .await
            .unwrap();

        let ctx = broker.context();
        let fetched = ctx
            .store
            .call(&FetchForProcessing {
                keys: &ctx.keys,
                queue: &queue,
                group: None,
                consumer_id: "gone",
                now: ctx.now(),
            })
            .await
            .unwrap();
        assert_eq!(fetched.as_deref(), Some("m"));

        let mut events = broker.subscribe();
        let reaper = ConsumerReaper::new(Arc::clone(ctx));
        assert_eq!(reaper.tick().await.unwrap(), 1);

        let message = broker.messages().get("m").await.unwrap();
        assert_eq!(message.state.status, MessageStatus::UnackRequeuing);
        assert!(
            ctx.store
                .hgetall(&ctx.keys.processing_registry(&queue))
                .await
                .unwrap()
                .is_empty()
        );

        let mut saw_down = false;
        while let Ok(event) = events.try_recv() {
            if event == (BrokerEvent::ConsumerDown { consumer_id: "gone".into() }) {
                saw_down = true;
            }
        }
        assert!(saw_down);
        assert_eq!(reaper.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_live_consumers_are_left_alone() {
        let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        let queue = QueueParams::new("test", "orders").unwrap();
        broker
            .queues()
            .create(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
            .await
            .unwrap();
        broker
            .producer()
            .publish(MessageEnvelope::new(serde_json::json!(1)).with_id("m").to_queue(queue.clone()))
            .await
            .unwrap();

        let ctx = broker.context();
        ctx.store.set_px(&ctx.keys.heartbeat("alive"), "1", 10_000).await.unwrap();
        ctx.store
            .call(&FetchForProcessing {
                keys: &ctx.keys,
                queue: &queue,
                group: None,
                consumer_id: "alive",
                now: ctx.now(),
            })
            .await
            .unwrap();

        let reaper = ConsumerReaper::new(Arc::clone(ctx));
        assert_eq!(reaper.tick().await.unwrap(), 0);
        let message = broker.messages().get("m").await.unwrap();
        assert_eq!(message.state.status, MessageStatus::Processing);
    }
}
