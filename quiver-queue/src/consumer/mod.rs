//! Message consumer.
//!
//! One consumer multiplexes any number of queue subscriptions. It polls them
//! round-robin, takes one message at a time into its processing list and
//! runs the subscription's handler under the message's consume timeout.
//! When a full round finds nothing, it sleeps for the poll interval.

mod heartbeat;
mod release;

pub(crate) use heartbeat::is_alive;
pub(crate) use release::{release_processing, unacknowledge};

use async_trait::async_trait;
use parking_lot::RwLock;
use quiver_redis::StoreExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock as Gate, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::broker::BrokerContext;
use crate::error::{QueueError, QueueResult};
use crate::events::BrokerEvent;
use crate::lifecycle::{Hook, Lifecycle, LifecycleState, Task};
use crate::message::{MessageEnvelope, UnackReason};
use crate::queue::{DeliveryModel, QueueParams, QueueRegistry};
use crate::scripts::{Acknowledge, FetchForProcessing, UnackTarget};
use heartbeat::Heartbeat;

/// Message handler function type.
pub type MessageHandler = Arc<
    dyn Fn(MessageEnvelope) -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct Subscription {
    queue: QueueParams,
    group: Option<String>,
    handler: MessageHandler,
}

impl Subscription {
    fn is(&self, queue: &QueueParams, group: Option<&str>) -> bool {
        self.queue == *queue && self.group.as_deref() == group
    }
}

struct ConsumerCore {
    id: String,
    ctx: Arc<BrokerContext>,
    subscriptions: RwLock<Vec<Subscription>>,
    cursor: AtomicUsize,
    // held shared for a whole poll pass, exclusively by `cancel`
    busy: Gate<()>,
}

impl ConsumerCore {
    /// One round-robin pass; handles at most one message.
    async fn poll_once(&self) -> QueueResult<bool> {
        let _busy = self.busy.read().await;
        let subscriptions = self.subscriptions.read().clone();
        if subscriptions.is_empty() {
            return Ok(false);
        }
        let start = self.cursor.load(Ordering::Relaxed);
        for offset in 0..subscriptions.len() {
            let index = (start + offset) % subscriptions.len();
            let sub = &subscriptions[index];
            let fetched = self
                .ctx
                .store
                .call(&FetchForProcessing {
                    keys: &self.ctx.keys,
                    queue: &sub.queue,
                    group: sub.group.as_deref(),
                    consumer_id: &self.id,
                    now: self.ctx.now(),
                })
                .await;
            match fetched {
                Ok(Some(id)) => {
                    self.cursor
                        .store((index + 1) % subscriptions.len(), Ordering::Relaxed);
                    self.handle(sub, id).await?;
                    return Ok(true);
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(consumer_id = %self.id, queue = %sub.queue, error = %e, "fetch failed");
                }
            }
        }
        Ok(false)
    }

    async fn handle(&self, sub: &Subscription, id: String) -> QueueResult<()> {
        debug!(consumer_id = %self.id, queue = %sub.queue, message_id = %id, "message received");
        self.ctx.events.emit(BrokerEvent::MessageReceived {
            queue: sub.queue.clone(),
            message_id: id.clone(),
            consumer_id: self.id.clone(),
        });

        let target = [UnackTarget {
            id: id.clone(),
            group: sub.group.clone(),
        }];
        let fields = self.ctx.store.hgetall(&self.ctx.keys.message(&id)).await?;
        let envelope = match MessageEnvelope::from_fields(&fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(consumer_id = %self.id, message_id = %id, error = %e, "unreadable message");
                self.unack(sub, UnackReason::ConsumeError, &target).await?;
                return Err(e);
            }
        };
        if envelope.state.expired {
            return self.unack(sub, UnackReason::TtlExpired, &target).await;
        }

        let limit = (envelope.consume_timeout > 0)
            .then(|| Duration::from_millis(envelope.consume_timeout));
        let mut task = tokio::spawn((sub.handler)(envelope));
        let joined = match limit {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    task.abort();
                    None
                }
            },
            None => Some((&mut task).await),
        };

        match joined {
            Some(Ok(Ok(()))) => self.ack(sub, &id).await,
            Some(Ok(Err(e))) => {
                warn!(consumer_id = %self.id, message_id = %id, error = %e, "handler failed");
                self.unack(sub, UnackReason::ConsumeError, &target).await
            }
            Some(Err(e)) => {
                warn!(consumer_id = %self.id, message_id = %id, error = %e, "handler panicked");
                self.unack(sub, UnackReason::ConsumeError, &target).await
            }
            None => {
                warn!(consumer_id = %self.id, message_id = %id, "handler timed out");
                self.unack(sub, UnackReason::Timeout, &target).await
            }
        }
    }

    async fn ack(&self, sub: &Subscription, id: &str) -> QueueResult<()> {
        let acked = self
            .ctx
            .store
            .call(&Acknowledge {
                keys: &self.ctx.keys,
                queue: &sub.queue,
                consumer_id: &self.id,
                id,
                now: self.ctx.now(),
                audit: &self.ctx.config.acknowledged,
            })
            .await;
        match acked {
            Ok(()) => {
                debug!(consumer_id = %self.id, message_id = %id, "message acknowledged");
                self.ctx.events.emit(BrokerEvent::MessageAcknowledged {
                    queue: sub.queue.clone(),
                    message_id: id.to_string(),
                    consumer_id: self.id.clone(),
                });
                Ok(())
            }
            Err(QueueError::MessageNotProcessing(_)) => {
                // released by the reaper while the handler ran
                warn!(consumer_id = %self.id, message_id = %id, "message no longer held, ack dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn unack(
        &self,
        sub: &Subscription,
        reason: UnackReason,
        targets: &[UnackTarget],
    ) -> QueueResult<()> {
        unacknowledge(&self.ctx, &sub.queue, &self.id, reason, targets).await?;
        Ok(())
    }

    fn queues(&self) -> Vec<QueueParams> {
        let mut queues: Vec<_> = self
            .subscriptions
            .read()
            .iter()
            .map(|s| s.queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }
}

async fn poll_loop(core: Arc<ConsumerCore>, mut stop: watch::Receiver<bool>) {
    let interval = core.ctx.config.consumer.poll_interval;
    loop {
        if *stop.borrow() {
            return;
        }
        match core.poll_once().await {
            Ok(true) => {
                tokio::task::yield_now().await;
                continue;
            }
            Ok(false) => {}
            Err(e) if e.is_fatal() => {
                error!(consumer_id = %core.id, error = %e, "fatal error, consumer stops polling");
                core.ctx.events.emit(BrokerEvent::WorkerError {
                    worker: format!("consumer:{}", core.id),
                    error: e.to_string(),
                    fatal: true,
                });
                return;
            }
            Err(e) => warn!(consumer_id = %core.id, error = %e, "poll failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

struct HeartbeatHook {
    core: Arc<ConsumerCore>,
    heartbeat: Arc<Heartbeat>,
    task: Task,
}

#[async_trait]
impl Hook for HeartbeatHook {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn up(&self) -> QueueResult<()> {
        self.heartbeat.beat().await?;
        let heartbeat = Arc::clone(&self.heartbeat);
        self.task.spawn(|stop| async move { heartbeat.run(stop).await });
        self.core.ctx.events.emit(BrokerEvent::ConsumerUp {
            consumer_id: self.core.id.clone(),
        });
        Ok(())
    }

    async fn down(&self) -> QueueResult<()> {
        self.task.stop().await;
        self.heartbeat.clear().await?;
        self.core.ctx.events.emit(BrokerEvent::ConsumerDown {
            consumer_id: self.core.id.clone(),
        });
        Ok(())
    }
}

struct PollHook {
    core: Arc<ConsumerCore>,
    task: Task,
}

#[async_trait]
impl Hook for PollHook {
    fn name(&self) -> &str {
        "poll"
    }

    async fn up(&self) -> QueueResult<()> {
        let core = Arc::clone(&self.core);
        self.task.spawn(|stop| poll_loop(core, stop));
        Ok(())
    }

    async fn down(&self) -> QueueResult<()> {
        self.task.stop().await;
        Ok(())
    }

    fn cleanup_required(&self) -> bool {
        self.core.ctx.config.consumer.release_on_shutdown
    }

    async fn cleanup(&self) -> QueueResult<()> {
        for queue in self.core.queues() {
            release_processing(
                &self.core.ctx,
                &queue,
                &self.core.id,
                UnackReason::OfflineConsumer,
                None,
            )
            .await?;
        }
        Ok(())
    }
}

/// Consumes messages from subscribed queues.
///
/// # Examples
///
/// ```no_run
/// use quiver_queue::prelude::*;
/// use quiver_redis::MemoryStore;
/// use std::sync::Arc;
///
/// # async fn example() -> QueueResult<()> {
/// let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new()))?;
/// let consumer = broker.consumer();
/// consumer
///     .consume(QueueParams::new("shop", "orders")?, None, |message| async move {
///         println!("order: {}", message.payload);
///         Ok(())
///     })
///     .await?;
/// consumer.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    core: Arc<ConsumerCore>,
    lifecycle: Lifecycle,
}

impl Consumer {
    pub(crate) fn new(ctx: Arc<BrokerContext>) -> Self {
        let id = Uuid::new_v4().to_string();
        let core = Arc::new(ConsumerCore {
            id: id.clone(),
            ctx: Arc::clone(&ctx),
            subscriptions: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            busy: Gate::new(()),
        });
        let hooks: Vec<Arc<dyn Hook>> = vec![
            Arc::new(HeartbeatHook {
                core: Arc::clone(&core),
                heartbeat: Arc::new(Heartbeat::new(ctx, &id)),
                task: Task::new(),
            }),
            Arc::new(PollHook {
                core: Arc::clone(&core),
                task: Task::new(),
            }),
        ];
        Self {
            lifecycle: Lifecycle::new(format!("consumer:{}", id), hooks),
            core,
        }
    }

    /// Consumer id.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Subscribed queues.
    pub fn queues(&self) -> Vec<QueueParams> {
        self.core.queues()
    }

    /// Subscribe to a queue, replacing the handler of an existing
    /// subscription to the same queue and group.
    ///
    /// Pub-sub queues are consumed through one of their consumer groups.
    pub async fn consume<F, Fut>(
        &self,
        queue: QueueParams,
        group: Option<&str>,
        handler: F,
    ) -> QueueResult<()>
    where
        F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        let registry = QueueRegistry::new(Arc::clone(&self.core.ctx));
        let props = registry.get_properties(&queue).await?;
        match (props.delivery_model, group) {
            (DeliveryModel::PubSub, None) => {
                return Err(QueueError::ConsumerGroupsRequired(queue.to_string()));
            }
            (DeliveryModel::PointToPoint, Some(_)) => {
                return Err(QueueError::ConsumerGroupsNotSupported);
            }
            (DeliveryModel::PubSub, Some(group)) => {
                if !registry.list_groups(&queue).await?.iter().any(|g| g == group) {
                    return Err(QueueError::ConsumerGroupNotFound(group.to_string()));
                }
            }
            (DeliveryModel::PointToPoint, None) => {}
        }

        let handler: MessageHandler = Arc::new(
            move |message: MessageEnvelope| -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>> {
                Box::pin(handler(message))
            },
        );
        let subscription = Subscription {
            queue,
            group: group.map(str::to_string),
            handler,
        };
        let mut subscriptions = self.core.subscriptions.write();
        subscriptions.retain(|s| !s.is(&subscription.queue, group));
        debug!(consumer_id = %self.core.id, queue = %subscription.queue, group = ?group, "subscribed");
        subscriptions.push(subscription);
        Ok(())
    }

    /// Drop a subscription and hand back the messages held for it with
    /// `OFFLINE_MESSAGE_HANDLER`. Returns `false` if there was none.
    ///
    /// A handler already running finishes first and settles its own
    /// message, so calling this from inside a handler of the same consumer
    /// deadlocks.
    pub async fn cancel(&self, queue: &QueueParams, group: Option<&str>) -> QueueResult<bool> {
        let removed = {
            let mut subscriptions = self.core.subscriptions.write();
            let before = subscriptions.len();
            subscriptions.retain(|s| !s.is(queue, group));
            before != subscriptions.len()
        };
        if removed {
            let _idle = self.core.busy.write().await;
            release_processing(
                &self.core.ctx,
                queue,
                &self.core.id,
                UnackReason::OfflineMessageHandler,
                group,
            )
            .await?;
            debug!(consumer_id = %self.core.id, queue = %queue, group = ?group, "unsubscribed");
        }
        Ok(removed)
    }

    /// Poll every subscription once and handle at most one message.
    ///
    /// [`start`](Self::start) does this in a loop. Calling it directly
    /// suits embedding the consumer in another scheduler; without a
    /// running heartbeat the reaper treats the consumer as offline.
    pub async fn poll_once(&self) -> QueueResult<bool> {
        self.core.poll_once().await
    }

    /// Start the heartbeat and the polling loop.
    ///
    /// Returns `false` when [`shutdown`](Self::shutdown) interrupted the
    /// start-up.
    pub async fn start(&self) -> QueueResult<bool> {
        self.lifecycle.start().await
    }

    /// Stop polling, clear the heartbeat and, when configured, hand back
    /// every message still held with `OFFLINE_CONSUMER`.
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.lifecycle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::message::{MessageStatus, UnackAction};
    use crate::queue::QueueType;
    use parking_lot::Mutex;
    use quiver_redis::MemoryStore;
    use std::sync::atomic::AtomicU32;

    async fn setup() -> (Broker, QueueParams) {
        let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        let queue = QueueParams::new("test", "orders").unwrap();
        broker
            .queues()
            .create(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
            .await
            .unwrap();
        (broker, queue)
    }

    async fn publish(broker: &Broker, queue: &QueueParams, message: MessageEnvelope) -> String {
        broker
            .producer()
            .publish(message.to_queue(queue.clone()))
            .await
            .unwrap()
            .remove(0)
    }

    async fn status(broker: &Broker, id: &str) -> MessageStatus {
        broker.messages().get(id).await.unwrap().state.status
    }

    #[tokio::test]
    async fn test_ack_on_success() {
        let (broker, queue) = setup().await;
        let id = publish(&broker, &queue, MessageEnvelope::new(serde_json::json!(1))).await;
        let mut events = broker.subscribe();

        let consumer = broker.consumer();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        consumer
            .consume(queue.clone(), None, move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(consumer.poll_once().await.unwrap());
        assert!(!consumer.poll_once().await.unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(status(&broker, &id).await, MessageStatus::Acknowledged);
        assert!(matches!(events.recv().await.unwrap(), BrokerEvent::MessageReceived { .. }));
        assert!(matches!(events.recv().await.unwrap(), BrokerEvent::MessageAcknowledged { .. }));
    }

    #[tokio::test]
    async fn test_handler_error_delays_message() {
        let (broker, queue) = setup().await;
        let id = publish(
            &broker,
            &queue,
            MessageEnvelope::new(serde_json::json!(1)).with_retry_delay(Duration::from_secs(5)),
        )
        .await;
        let consumer = broker.consumer();
        consumer
            .consume(queue.clone(), None, |_| async {
                Err(QueueError::HandlerFailed("handler failed".into()))
            })
            .await
            .unwrap();

        assert!(consumer.poll_once().await.unwrap());
        let message = broker.messages().get(&id).await.unwrap();
        assert_eq!(message.state.status, MessageStatus::UnackDelaying);
        assert_eq!(message.state.attempts, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_a_consume_error() {
        let (broker, queue) = setup().await;
        let id = publish(
            &broker,
            &queue,
            MessageEnvelope::new(serde_json::json!(1)).with_retry_delay(Duration::ZERO),
        )
        .await;
        let consumer = broker.consumer();
        consumer
            .consume(queue.clone(), None, |_| async { panic!("boom") })
            .await
            .unwrap();

        assert!(consumer.poll_once().await.unwrap());
        assert_eq!(status(&broker, &id).await, MessageStatus::UnackRequeuing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_unacknowledges() {
        let (broker, queue) = setup().await;
        let id = publish(
            &broker,
            &queue,
            MessageEnvelope::new(serde_json::json!(1))
                .with_consume_timeout(Duration::from_millis(100))
                .with_retry_threshold(0),
        )
        .await;
        let mut events = broker.subscribe();
        let consumer = broker.consumer();
        consumer
            .consume(queue.clone(), None, |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap();

        assert!(consumer.poll_once().await.unwrap());
        assert_eq!(status(&broker, &id).await, MessageStatus::DeadLettered);
        events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            BrokerEvent::MessageUnacknowledged {
                reason: UnackReason::Timeout,
                action: UnackAction::DeadLetter(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_round_robin_across_queues() {
        let (broker, orders) = setup().await;
        let audit = QueueParams::new("test", "audit").unwrap();
        broker
            .queues()
            .create(&audit, QueueType::Fifo, DeliveryModel::PointToPoint)
            .await
            .unwrap();
        for _ in 0..2 {
            publish(&broker, &orders, MessageEnvelope::new(serde_json::json!("o"))).await;
            publish(&broker, &audit, MessageEnvelope::new(serde_json::json!("a"))).await;
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let consumer = broker.consumer();
        for queue in [&orders, &audit] {
            let order = Arc::clone(&order);
            consumer
                .consume(queue.clone(), None, move |message| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().push(message.payload.as_str().unwrap_or_default().to_string());
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }
        while consumer.poll_once().await.unwrap() {}
        assert_eq!(*order.lock(), vec!["o", "a", "o", "a"]);
    }

    #[tokio::test]
    async fn test_subscription_rules() {
        let (broker, orders) = setup().await;
        let consumer = broker.consumer();
        assert!(matches!(
            consumer.consume(orders.clone(), Some("g"), |_| async { Ok(()) }).await,
            Err(QueueError::ConsumerGroupsNotSupported)
        ));

        let events = QueueParams::new("test", "events").unwrap();
        broker
            .queues()
            .create(&events, QueueType::Fifo, DeliveryModel::PubSub)
            .await
            .unwrap();
        assert!(matches!(
            consumer.consume(events.clone(), None, |_| async { Ok(()) }).await,
            Err(QueueError::ConsumerGroupsRequired(_))
        ));
        assert!(matches!(
            consumer.consume(events.clone(), Some("billing"), |_| async { Ok(()) }).await,
            Err(QueueError::ConsumerGroupNotFound(_))
        ));
        broker.queues().create_group(&events, "billing").await.unwrap();
        consumer
            .consume(events.clone(), Some("billing"), |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(consumer.queues(), vec![events]);
    }

    #[tokio::test]
    async fn test_cancel_releases_held_messages() {
        let (broker, queue) = setup().await;
        let id = publish(
            &broker,
            &queue,
            MessageEnvelope::new(serde_json::json!(1)).with_retry_delay(Duration::ZERO),
        )
        .await;
        let consumer = broker.consumer();
        consumer.consume(queue.clone(), None, |_| async { Ok(()) }).await.unwrap();

        // take the message without handling it
        let ctx = broker.context();
        ctx.store
            .call(&FetchForProcessing {
                keys: &ctx.keys,
                queue: &queue,
                group: None,
                consumer_id: consumer.id(),
                now: ctx.now(),
            })
            .await
            .unwrap();
        assert_eq!(status(&broker, &id).await, MessageStatus::Processing);

        assert!(consumer.cancel(&queue, None).await.unwrap());
        assert!(!consumer.cancel(&queue, None).await.unwrap());
        assert_eq!(status(&broker, &id).await, MessageStatus::UnackRequeuing);
        assert!(consumer.queues().is_empty());
        // registry entry gone, so the queue can be deleted once empty
        assert!(
            ctx.store
                .hgetall(&ctx.keys.processing_registry(&queue))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_cancel_waits_for_running_handler() {
        let (broker, queue) = setup().await;
        let id = publish(
            &broker,
            &queue,
            MessageEnvelope::new(serde_json::json!(1)).with_retry_delay(Duration::ZERO),
        )
        .await;
        let consumer = Arc::new(broker.consumer());
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        {
            let (entered, release, calls) =
                (Arc::clone(&entered), Arc::clone(&release), Arc::clone(&calls));
            consumer
                .consume(queue.clone(), None, move |_| {
                    let (entered, release) = (Arc::clone(&entered), Arc::clone(&release));
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        entered.notify_one();
                        release.notified().await;
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        let polling = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.poll_once().await })
        };
        entered.notified().await;

        let cancelling = {
            let (consumer, queue) = (Arc::clone(&consumer), queue.clone());
            tokio::spawn(async move { consumer.cancel(&queue, None).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!cancelling.is_finished());
        assert_eq!(status(&broker, &id).await, MessageStatus::Processing);

        release.notify_one();
        assert!(polling.await.unwrap().unwrap());
        assert!(cancelling.await.unwrap().unwrap());

        assert_eq!(status(&broker, &id).await, MessageStatus::Acknowledged);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!consumer.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (broker, queue) = setup().await;
        let id = publish(&broker, &queue, MessageEnvelope::new(serde_json::json!(1))).await;
        let consumer = broker.consumer();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        consumer
            .consume(queue.clone(), None, move |message| {
                let done_tx = done_tx.clone();
                async move {
                    let _ = done_tx.send(message.id);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(consumer.start().await.unwrap());
        assert_eq!(consumer.state(), LifecycleState::Up);
        assert!(is_alive(broker.context(), consumer.id()).await.unwrap());
        assert_eq!(done_rx.recv().await.unwrap(), id);

        consumer.shutdown().await.unwrap();
        assert_eq!(consumer.state(), LifecycleState::Down);
        assert!(!is_alive(broker.context(), consumer.id()).await.unwrap());
    }
}
