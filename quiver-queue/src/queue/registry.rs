//! Queue registry.

use quiver_redis::{StoreExt, TxOp};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{DeliveryModel, QueueCounters, QueueParams, QueueProperties, QueueState, QueueType};
use crate::broker::{BrokerContext, MAX_WATCH_ATTEMPTS};
use crate::error::{QueueError, QueueResult};
use crate::scripts::{CreateConsumerGroup, CreateQueue, DeleteConsumerGroup, DeleteQueue};

/// Creates, inspects and deletes queues and their consumer groups.
#[derive(Clone)]
pub struct QueueRegistry {
    ctx: Arc<BrokerContext>,
}

impl QueueRegistry {
    pub(crate) fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Create a queue.
    pub async fn create(
        &self,
        queue: &QueueParams,
        queue_type: QueueType,
        delivery_model: DeliveryModel,
    ) -> QueueResult<QueueProperties> {
        self.ctx
            .store
            .call(&CreateQueue {
                keys: &self.ctx.keys,
                queue,
                queue_type,
                delivery_model,
                now: self.ctx.now(),
            })
            .await?;
        info!(queue = %queue, %queue_type, %delivery_model, "queue created");
        self.get_properties(queue).await
    }

    /// Check if a queue exists.
    pub async fn exists(&self, queue: &QueueParams) -> QueueResult<bool> {
        Ok(self.ctx.store.exists(&self.ctx.keys.properties(queue)).await?)
    }

    /// Properties and counters of a queue.
    pub async fn get_properties(&self, queue: &QueueParams) -> QueueResult<QueueProperties> {
        let fields = self
            .ctx
            .store
            .hgetall(&self.ctx.keys.properties(queue))
            .await?;
        if fields.is_empty() {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        QueueProperties::from_fields(queue.clone(), &fields)
    }

    /// Every queue, sorted.
    pub async fn list(&self) -> QueueResult<Vec<QueueParams>> {
        let ids = self.ctx.store.smembers(&self.ctx.keys.queues_index()).await?;
        let mut queues = ids
            .iter()
            .map(|id| QueueParams::parse(id, &self.ctx.config.namespace))
            .collect::<QueueResult<Vec<_>>>()?;
        queues.sort();
        Ok(queues)
    }

    /// Queues of one namespace.
    pub async fn list_in_namespace(&self, ns: &str) -> QueueResult<Vec<QueueParams>> {
        let names = self
            .ctx
            .store
            .smembers(&self.ctx.keys.namespace_queues(ns))
            .await?;
        names.iter().map(|name| QueueParams::new(ns, name)).collect()
    }

    /// Every namespace holding at least one queue.
    pub async fn list_namespaces(&self) -> QueueResult<Vec<String>> {
        Ok(self.ctx.store.smembers(&self.ctx.keys.namespaces()).await?)
    }

    /// Delete an empty, idle and unbound queue.
    pub async fn delete(&self, queue: &QueueParams) -> QueueResult<()> {
        self.ctx
            .store
            .call(&DeleteQueue {
                keys: &self.ctx.keys,
                queue,
            })
            .await?;
        info!(queue = %queue, "queue deleted");
        Ok(())
    }

    /// Change the operational state.
    pub async fn set_operational_state(
        &self,
        queue: &QueueParams,
        state: QueueState,
    ) -> QueueResult<()> {
        let key = self.ctx.keys.properties(queue);
        for attempt in 1..=MAX_WATCH_ATTEMPTS {
            let mut session = self.ctx.store.watch(std::slice::from_ref(&key)).await?;
            let Some(current) = session.hget(&key, "state").await? else {
                session.discard().await?;
                return Err(QueueError::QueueNotFound(queue.to_string()));
            };
            if current == state.as_str() {
                session.discard().await?;
                return Ok(());
            }
            let ops = vec![TxOp::HSet {
                key: key.clone(),
                field: "state".into(),
                value: state.to_string(),
            }];
            if session.exec(ops).await? {
                info!(queue = %queue, from = %current, to = %state, "queue state changed");
                return Ok(());
            }
            warn!(queue = %queue, attempt, "queue state update conflicted, retrying");
        }
        Err(QueueError::Concurrency(format!("state of queue {}", queue)))
    }

    /// Add a consumer group to a pub-sub queue.
    pub async fn create_group(&self, queue: &QueueParams, group: &str) -> QueueResult<()> {
        let group = quiver_redis::validate_name(group)?;
        self.ctx
            .store
            .call(&CreateConsumerGroup {
                keys: &self.ctx.keys,
                queue,
                group: &group,
            })
            .await?;
        debug!(queue = %queue, group = %group, "consumer group created");
        Ok(())
    }

    /// Remove a consumer group with no waiting messages.
    pub async fn delete_group(&self, queue: &QueueParams, group: &str) -> QueueResult<()> {
        self.ctx
            .store
            .call(&DeleteConsumerGroup {
                keys: &self.ctx.keys,
                queue,
                group,
            })
            .await?;
        debug!(queue = %queue, group = %group, "consumer group deleted");
        Ok(())
    }

    /// Consumer groups of a queue, sorted.
    pub async fn list_groups(&self, queue: &QueueParams) -> QueueResult<Vec<String>> {
        Ok(self
            .ctx
            .store
            .smembers(&self.ctx.keys.consumer_groups(queue))
            .await?)
    }

    /// Pending targets of a queue: its groups for pub-sub, else the queue
    /// itself.
    pub(crate) async fn targets(&self, queue: &QueueParams) -> QueueResult<Vec<Option<String>>> {
        let props = self.get_properties(queue).await?;
        Ok(match props.delivery_model {
            DeliveryModel::PointToPoint => vec![None],
            DeliveryModel::PubSub => self
                .list_groups(queue)
                .await?
                .into_iter()
                .map(Some)
                .collect(),
        })
    }

    /// Count messages by reading every storage structure of the queue.
    ///
    /// Unlike the stored counters this is not atomic; compare against
    /// [`QueueProperties::counters`] only while the queue is quiescent.
    pub async fn count_messages_by_status(&self, queue: &QueueParams) -> QueueResult<QueueCounters> {
        let (store, keys) = (&self.ctx.store, &self.ctx.keys);
        let mut counters = QueueCounters {
            scheduled: store.zcard(&keys.scheduled(queue)).await?,
            acknowledged: store.zcard(&keys.acknowledged(queue)).await?,
            dead_lettered: store.zcard(&keys.dead_lettered(queue)).await?,
            messages: store.zcard(&keys.messages_index(queue)).await?,
            ..QueueCounters::default()
        };
        for target in self.targets(queue).await? {
            let group = target.as_deref();
            counters.pending += store.llen(&keys.pending(queue, group)).await?;
            counters.pending += store.zcard(&keys.priority_pending(queue, group)).await?;
            counters.delayed += store.zcard(&keys.delayed(queue, group)).await?;
            counters.requeued += store.llen(&keys.requeued(queue, group)).await?;
        }
        let registry = store.hgetall(&keys.processing_registry(queue)).await?;
        for processing in registry.values() {
            counters.processing += store.llen(processing).await?;
        }
        Ok(counters)
    }
}
