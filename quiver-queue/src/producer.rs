//! Publishing.

use quiver_redis::StoreExt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::broker::BrokerContext;
use crate::error::{QueueError, QueueResult};
use crate::events::BrokerEvent;
use crate::exchange::ExchangeRouter;
use crate::message::MessageEnvelope;
use crate::queue::{DeliveryModel, QueueParams, QueueRegistry};
use crate::scripts::Publish;

/// Publishes messages to queues and exchanges.
#[derive(Clone)]
pub struct Producer {
    ctx: Arc<BrokerContext>,
}

impl Producer {
    pub(crate) fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Publish a message and return the id of every stored copy.
    ///
    /// A message addressed to a queue is stored once, except on a pub-sub
    /// queue without a consumer group where every group gets its own copy.
    /// A message addressed to an exchange is stored once per matching
    /// queue. The first copy keeps the message id; the others get fresh
    /// ids.
    pub async fn publish(&self, message: MessageEnvelope) -> QueueResult<Vec<String>> {
        message.schedule.validate()?;
        let queues = self.destinations(&message).await?;

        let now = self.ctx.now();
        let scheduled_at = message.schedule.first_delivery_at(now)?;
        let registry = QueueRegistry::new(Arc::clone(&self.ctx));

        let mut ids = Vec::new();
        for queue in queues {
            let groups = match &message.consumer_group_id {
                Some(group) => vec![Some(group.clone())],
                None => {
                    let props = registry.get_properties(&queue).await?;
                    match props.delivery_model {
                        DeliveryModel::PointToPoint => vec![None],
                        DeliveryModel::PubSub => {
                            let groups = registry.list_groups(&queue).await?;
                            if groups.is_empty() {
                                return Err(QueueError::ConsumerGroupsRequired(queue.to_string()));
                            }
                            groups.into_iter().map(Some).collect()
                        }
                    }
                }
            };

            for group in groups {
                let mut copy = message.clone();
                if !ids.is_empty() {
                    copy.id = Uuid::new_v4().to_string();
                }
                copy.destination = Some(queue.clone());
                copy.consumer_group_id = group;
                if copy.created_at == 0 {
                    copy.created_at = now;
                }
                self.store(&copy, scheduled_at, now).await?;
                ids.push(copy.id);
            }
        }
        Ok(ids)
    }

    async fn destinations(&self, message: &MessageEnvelope) -> QueueResult<Vec<QueueParams>> {
        if let Some(queue) = &message.destination {
            return Ok(vec![queue.clone()]);
        }
        let Some(exchange) = &message.exchange else {
            return Err(QueueError::MessageDestinationRequired);
        };
        let routing_key = message.routing_key.as_deref().unwrap_or_default();
        let queues = ExchangeRouter::new(Arc::clone(&self.ctx))
            .resolve(exchange, routing_key)
            .await?;
        if queues.is_empty() {
            return Err(QueueError::NoMatchedQueues(routing_key.to_string()));
        }
        Ok(queues)
    }

    async fn store(
        &self,
        message: &MessageEnvelope,
        scheduled_at: Option<i64>,
        now: i64,
    ) -> QueueResult<()> {
        let queue = message.queue()?;
        self.ctx
            .store
            .call(&Publish {
                keys: &self.ctx.keys,
                queue,
                group: message.consumer_group_id.as_deref(),
                id: &message.id,
                priority: message.priority,
                scheduled_at,
                now,
                fields: message.to_fields()?,
            })
            .await?;
        debug!(
            queue = %queue,
            message_id = %message.id,
            group = ?message.consumer_group_id,
            scheduled = scheduled_at.is_some(),
            "message published"
        );
        self.ctx.events.emit(BrokerEvent::MessagePublished {
            queue: queue.clone(),
            message_id: message.id.clone(),
            consumer_group: message.consumer_group_id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::clock::ManualClock;
    use crate::config::BrokerConfig;
    use crate::exchange::ExchangeType;
    use crate::message::{MessagePriority, MessageStatus};
    use crate::queue::QueueType;
    use quiver_redis::MemoryStore;
    use std::time::Duration;

    const T0: i64 = 1_704_067_200_000;

    fn broker() -> Broker {
        Broker::with_clock(
            BrokerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(T0)),
        )
        .unwrap()
    }

    fn q(name: &str) -> QueueParams {
        QueueParams::new("test", name).unwrap()
    }

    #[tokio::test]
    async fn test_publish_pending_and_scheduled() {
        let broker = broker();
        broker
            .queues()
            .create(&q("orders"), QueueType::Fifo, DeliveryModel::PointToPoint)
            .await
            .unwrap();

        let now = broker
            .producer()
            .publish(MessageEnvelope::new(serde_json::json!(1)).with_id("now").to_queue(q("orders")))
            .await
            .unwrap();
        assert_eq!(now, vec!["now"]);

        let later = broker
            .producer()
            .publish(
                MessageEnvelope::new(serde_json::json!(2))
                    .to_queue(q("orders"))
                    .with_delay(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        let messages = broker.messages();
        let first = messages.get("now").await.unwrap();
        assert_eq!(first.state.status, MessageStatus::Pending);
        assert_eq!(first.state.published_at, Some(T0));
        assert_eq!(first.created_at, T0);
        assert_eq!(
            messages.get(&later[0]).await.unwrap().state.status,
            MessageStatus::Scheduled
        );

        let counters = broker.queues().get_properties(&q("orders")).await.unwrap().counters;
        assert_eq!((counters.pending, counters.scheduled, counters.messages), (1, 1, 2));
    }

    #[tokio::test]
    async fn test_priority_rules() {
        let broker = broker();
        broker
            .queues()
            .create(&q("urgent"), QueueType::Priority, DeliveryModel::PointToPoint)
            .await
            .unwrap();
        let producer = broker.producer();
        assert!(matches!(
            producer
                .publish(MessageEnvelope::new(serde_json::json!(1)).to_queue(q("urgent")))
                .await,
            Err(QueueError::MessagePriorityRequired)
        ));
        producer
            .publish(
                MessageEnvelope::new(serde_json::json!(1))
                    .to_queue(q("urgent"))
                    .with_priority(MessagePriority::High),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pub_sub_fan_out() {
        let broker = broker();
        let events = q("events");
        broker
            .queues()
            .create(&events, QueueType::Fifo, DeliveryModel::PubSub)
            .await
            .unwrap();
        let message = || MessageEnvelope::new(serde_json::json!("e")).to_queue(q("events"));

        assert!(matches!(
            broker.producer().publish(message()).await,
            Err(QueueError::ConsumerGroupsRequired(_))
        ));

        broker.queues().create_group(&events, "audit").await.unwrap();
        broker.queues().create_group(&events, "billing").await.unwrap();
        let ids = broker.producer().publish(message().with_id("m1")).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "m1");
        assert_ne!(ids[0], ids[1]);

        let copies = broker.messages().get_many(&ids).await.unwrap();
        let groups: Vec<_> = copies.iter().map(|m| m.consumer_group_id.clone()).collect();
        assert_eq!(groups, vec![Some("audit".into()), Some("billing".into())]);

        let one = broker
            .producer()
            .publish(message().with_consumer_group("billing"))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_through_exchange() {
        let broker = broker();
        for name in ["orders", "audit"] {
            broker
                .queues()
                .create(&q(name), QueueType::Fifo, DeliveryModel::PointToPoint)
                .await
                .unwrap();
        }
        let router = broker.exchanges();
        router.create("events", ExchangeType::Topic).await.unwrap();
        router.bind("events", &q("orders"), Some("order.#")).await.unwrap();
        router.bind("events", &q("audit"), Some("#")).await.unwrap();

        let producer = broker.producer();
        let ids = producer
            .publish(MessageEnvelope::new(serde_json::json!(1)).to_exchange("events", "order.created"))
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        let ids = producer
            .publish(MessageEnvelope::new(serde_json::json!(1)).to_exchange("events", "user.created"))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(
            broker.messages().get(&ids[0]).await.unwrap().destination,
            Some(q("audit"))
        );

        router.unbind("events", &q("audit"), Some("#")).await.unwrap();
        assert!(matches!(
            producer
                .publish(MessageEnvelope::new(serde_json::json!(1)).to_exchange("events", "user.created"))
                .await,
            Err(QueueError::NoMatchedQueues(_))
        ));
    }

    #[tokio::test]
    async fn test_destination_required() {
        let err = broker()
            .producer()
            .publish(MessageEnvelope::new(serde_json::json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::MessageDestinationRequired));
    }
}
