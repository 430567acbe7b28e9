//! Exchanges: direct, topic and fanout routing to queues.
//!
//! Binding changes read several keys before deciding what to write, so they
//! run inside optimistic [`Watch`](quiver_redis::Watch) sessions and retry
//! when a concurrent change wins.

mod topic;

pub use topic::{matches, validate_pattern, validate_routing_key};

use quiver_redis::{TxOp, validate_name};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerContext, MAX_WATCH_ATTEMPTS};
use crate::error::{QueueError, QueueResult};
use crate::queue::{QueueParams, QueueType, string_enum};

/// Binding key used by fanout exchanges.
const FANOUT_BINDING: &str = "_fanout";

/// Exchange variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeType {
    /// Routing key equals binding key.
    Direct,
    /// Routing key matches a binding pattern.
    Topic,
    /// Every bound queue.
    Fanout,
}

string_enum!(ExchangeType {
    Direct => "DIRECT",
    Topic => "TOPIC",
    Fanout => "FANOUT",
});

/// An exchange and its bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    /// Exchange name.
    pub name: String,
    /// Variant.
    pub exchange_type: ExchangeType,
    /// Type shared by the bound queues, if any are bound.
    pub queue_type: Option<QueueType>,
    /// Binding key (or pattern) to bound queues.
    pub bindings: BTreeMap<String, Vec<QueueParams>>,
}

/// Binds queues to exchanges and resolves routing keys.
#[derive(Clone)]
pub struct ExchangeRouter {
    ctx: Arc<BrokerContext>,
}

impl ExchangeRouter {
    pub(crate) fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    fn binding_key(exchange_type: ExchangeType, binding_key: Option<&str>) -> QueueResult<String> {
        match exchange_type {
            ExchangeType::Fanout => Ok(FANOUT_BINDING.to_string()),
            ExchangeType::Direct | ExchangeType::Topic => {
                let key = binding_key.ok_or_else(|| QueueError::InvalidRoutingKey(String::new()))?;
                if exchange_type == ExchangeType::Direct {
                    validate_routing_key(key)?;
                } else {
                    validate_pattern(key)?;
                }
                Ok(key.to_string())
            }
        }
    }

    fn parse_type(name: &str, fields: &std::collections::HashMap<String, String>) -> QueueResult<ExchangeType> {
        fields
            .get("type")
            .ok_or_else(|| QueueError::ExchangeNotFound(name.to_string()))?
            .parse()
    }

    fn parse_queues(&self, ids: &[String]) -> QueueResult<Vec<QueueParams>> {
        ids.iter()
            .map(|id| QueueParams::parse(id, &self.ctx.config.namespace))
            .collect()
    }

    /// Declare an exchange. Declaring it again with the same type is a
    /// no-op.
    pub async fn create(&self, name: &str, exchange_type: ExchangeType) -> QueueResult<()> {
        let name = validate_name(name)?;
        let meta = self.ctx.keys.exchange(&name);
        for attempt in 1..=MAX_WATCH_ATTEMPTS {
            let mut session = self.ctx.store.watch(std::slice::from_ref(&meta)).await?;
            if let Some(existing) = session.hget(&meta, "type").await? {
                session.discard().await?;
                return if existing == exchange_type.as_str() {
                    Ok(())
                } else {
                    Err(QueueError::ExchangeTypeMismatch(name))
                };
            }
            let ops = vec![
                TxOp::HSet {
                    key: meta.clone(),
                    field: "type".into(),
                    value: exchange_type.to_string(),
                },
                TxOp::SAdd {
                    key: self.ctx.keys.exchanges_index(),
                    member: name.clone(),
                },
            ];
            if session.exec(ops).await? {
                info!(exchange = %name, %exchange_type, "exchange created");
                return Ok(());
            }
            warn!(exchange = %name, attempt, "exchange creation conflicted, retrying");
        }
        Err(QueueError::Concurrency(format!("exchange {}", name)))
    }

    /// Delete an exchange with no bound queues.
    pub async fn delete(&self, name: &str) -> QueueResult<()> {
        let keys = &self.ctx.keys;
        let meta = keys.exchange(name);
        let bound = keys.exchange_queues(name);
        let binding_keys = keys.exchange_binding_keys(name);
        let watched = [meta.clone(), bound.clone(), binding_keys.clone()];
        for attempt in 1..=MAX_WATCH_ATTEMPTS {
            let mut session = self.ctx.store.watch(&watched).await?;
            if !session.exists(&meta).await? {
                session.discard().await?;
                return Err(QueueError::ExchangeNotFound(name.to_string()));
            }
            if session.scard(&binding_keys).await? > 0 || !session.hgetall(&bound).await?.is_empty() {
                session.discard().await?;
                return Err(QueueError::ExchangeHasBoundQueues(name.to_string()));
            }
            let ops = vec![
                TxOp::Del { key: meta.clone() },
                TxOp::SRem {
                    key: keys.exchanges_index(),
                    member: name.to_string(),
                },
            ];
            if session.exec(ops).await? {
                info!(exchange = %name, "exchange deleted");
                return Ok(());
            }
            warn!(exchange = %name, attempt, "exchange deletion conflicted, retrying");
        }
        Err(QueueError::Concurrency(format!("exchange {}", name)))
    }

    /// Bind a queue. Binding twice under the same key is a no-op.
    ///
    /// `binding_key` is the routing key of a direct exchange or the pattern
    /// of a topic exchange; fanout exchanges ignore it.
    pub async fn bind(
        &self,
        exchange: &str,
        queue: &QueueParams,
        binding_key: Option<&str>,
    ) -> QueueResult<()> {
        let keys = &self.ctx.keys;
        let meta = keys.exchange(exchange);
        let bound = keys.exchange_queues(exchange);
        let binding_keys = keys.exchange_binding_keys(exchange);
        let props = keys.properties(queue);
        let queue_exchanges = keys.queue_exchanges(queue);
        let queue_id = queue.to_string();

        for attempt in 1..=MAX_WATCH_ATTEMPTS {
            // the binding set key depends on the exchange type, read it first
            let exchange_type = {
                let fields = self.ctx.store.hgetall(&meta).await?;
                Self::parse_type(exchange, &fields)?
            };
            let binding = Self::binding_key(exchange_type, binding_key)?;
            let binding_set = keys.exchange_binding(exchange, &binding);
            let watched = [
                meta.clone(),
                bound.clone(),
                binding_keys.clone(),
                binding_set.clone(),
                props.clone(),
                queue_exchanges.clone(),
            ];

            let mut session = self.ctx.store.watch(&watched).await?;
            let fields = session.hgetall(&meta).await?;
            if Self::parse_type(exchange, &fields)? != exchange_type {
                session.discard().await?;
                continue;
            }
            let Some(queue_type) = session.hget(&props, "queueType").await? else {
                session.discard().await?;
                return Err(QueueError::QueueNotFound(queue_id));
            };
            let counts = session.hgetall(&bound).await?;
            if !counts.is_empty()
                && let Some(bound_type) = fields.get("queueType")
                && *bound_type != queue_type
            {
                session.discard().await?;
                return Err(QueueError::ExchangeQueueTypeMismatch(exchange.to_string()));
            }
            if session.smembers(&binding_set).await?.contains(&queue_id) {
                session.discard().await?;
                return Ok(());
            }
            let count = counts
                .get(&queue_id)
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);

            let ops = vec![
                TxOp::SAdd {
                    key: binding_set.clone(),
                    member: queue_id.clone(),
                },
                TxOp::SAdd {
                    key: binding_keys.clone(),
                    member: binding.clone(),
                },
                TxOp::HSet {
                    key: bound.clone(),
                    field: queue_id.clone(),
                    value: (count + 1).to_string(),
                },
                TxOp::SAdd {
                    key: queue_exchanges.clone(),
                    member: exchange.to_string(),
                },
                TxOp::HSet {
                    key: meta.clone(),
                    field: "queueType".into(),
                    value: queue_type,
                },
            ];
            if session.exec(ops).await? {
                debug!(exchange = %exchange, queue = %queue, binding = %binding, "queue bound");
                return Ok(());
            }
            warn!(exchange = %exchange, queue = %queue, attempt, "binding conflicted, retrying");
        }
        Err(QueueError::Concurrency(format!(
            "binding {} to {}",
            queue, exchange
        )))
    }

    /// Remove a binding. Returns `false` when it did not exist.
    pub async fn unbind(
        &self,
        exchange: &str,
        queue: &QueueParams,
        binding_key: Option<&str>,
    ) -> QueueResult<bool> {
        let keys = &self.ctx.keys;
        let meta = keys.exchange(exchange);
        let bound = keys.exchange_queues(exchange);
        let binding_keys = keys.exchange_binding_keys(exchange);
        let queue_exchanges = keys.queue_exchanges(queue);
        let queue_id = queue.to_string();

        for attempt in 1..=MAX_WATCH_ATTEMPTS {
            let exchange_type = {
                let fields = self.ctx.store.hgetall(&meta).await?;
                Self::parse_type(exchange, &fields)?
            };
            let binding = Self::binding_key(exchange_type, binding_key)?;
            let binding_set = keys.exchange_binding(exchange, &binding);
            let watched = [
                meta.clone(),
                bound.clone(),
                binding_keys.clone(),
                binding_set.clone(),
                queue_exchanges.clone(),
            ];

            let mut session = self.ctx.store.watch(&watched).await?;
            let members = session.smembers(&binding_set).await?;
            if !members.contains(&queue_id) {
                session.discard().await?;
                return Ok(false);
            }
            let counts = session.hgetall(&bound).await?;
            let count = counts
                .get(&queue_id)
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(1);

            let mut ops = vec![TxOp::SRem {
                key: binding_set.clone(),
                member: queue_id.clone(),
            }];
            if members.len() == 1 {
                ops.push(TxOp::SRem {
                    key: binding_keys.clone(),
                    member: binding.clone(),
                });
            }
            if count <= 1 {
                ops.push(TxOp::HDel {
                    key: bound.clone(),
                    field: queue_id.clone(),
                });
                ops.push(TxOp::SRem {
                    key: queue_exchanges.clone(),
                    member: exchange.to_string(),
                });
                if counts.len() == 1 {
                    ops.push(TxOp::HDel {
                        key: meta.clone(),
                        field: "queueType".into(),
                    });
                }
            } else {
                ops.push(TxOp::HSet {
                    key: bound.clone(),
                    field: queue_id.clone(),
                    value: (count - 1).to_string(),
                });
            }
            if session.exec(ops).await? {
                debug!(exchange = %exchange, queue = %queue, binding = %binding, "queue unbound");
                return Ok(true);
            }
            warn!(exchange = %exchange, queue = %queue, attempt, "unbinding conflicted, retrying");
        }
        Err(QueueError::Concurrency(format!(
            "unbinding {} from {}",
            queue, exchange
        )))
    }

    /// Queues a routing key reaches, sorted and without duplicates.
    ///
    /// Fanout exchanges ignore the routing key.
    pub async fn resolve(&self, exchange: &str, routing_key: &str) -> QueueResult<Vec<QueueParams>> {
        let keys = &self.ctx.keys;
        let fields = self.ctx.store.hgetall(&keys.exchange(exchange)).await?;
        let exchange_type = Self::parse_type(exchange, &fields)?;

        let bindings = match exchange_type {
            ExchangeType::Fanout => vec![FANOUT_BINDING.to_string()],
            ExchangeType::Direct => {
                validate_routing_key(routing_key)?;
                vec![routing_key.to_string()]
            }
            ExchangeType::Topic => {
                validate_routing_key(routing_key)?;
                self.ctx
                    .store
                    .smembers(&keys.exchange_binding_keys(exchange))
                    .await?
                    .into_iter()
                    .filter(|pattern| matches(pattern, routing_key))
                    .collect()
            }
        };

        let mut ids = BTreeSet::new();
        for binding in bindings {
            ids.extend(
                self.ctx
                    .store
                    .smembers(&keys.exchange_binding(exchange, &binding))
                    .await?,
            );
        }
        let ids: Vec<String> = ids.into_iter().collect();
        let mut queues = self.parse_queues(&ids)?;
        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    /// Every exchange name, sorted.
    pub async fn list(&self) -> QueueResult<Vec<String>> {
        Ok(self.ctx.store.smembers(&self.ctx.keys.exchanges_index()).await?)
    }

    /// An exchange with its bindings.
    pub async fn get(&self, name: &str) -> QueueResult<Exchange> {
        let keys = &self.ctx.keys;
        let fields = self.ctx.store.hgetall(&keys.exchange(name)).await?;
        let exchange_type = Self::parse_type(name, &fields)?;
        let queue_type = fields.get("queueType").map(|t| t.parse()).transpose()?;

        let mut bindings = BTreeMap::new();
        for binding in self
            .ctx
            .store
            .smembers(&keys.exchange_binding_keys(name))
            .await?
        {
            let ids = self
                .ctx
                .store
                .smembers(&keys.exchange_binding(name, &binding))
                .await?;
            bindings.insert(binding, self.parse_queues(&ids)?);
        }
        Ok(Exchange {
            name: name.to_string(),
            exchange_type,
            queue_type,
            bindings,
        })
    }

    /// Exchanges a queue is bound to.
    pub async fn exchanges_of(&self, queue: &QueueParams) -> QueueResult<Vec<String>> {
        Ok(self
            .ctx
            .store
            .smembers(&self.ctx.keys.queue_exchanges(queue))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::queue::DeliveryModel;
    use quiver_redis::MemoryStore;

    async fn setup() -> Broker {
        let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        for (name, queue_type) in [
            ("orders", QueueType::Fifo),
            ("audit", QueueType::Fifo),
            ("urgent", QueueType::Priority),
        ] {
            broker
                .queues()
                .create(&q(name), queue_type, DeliveryModel::PointToPoint)
                .await
                .unwrap();
        }
        broker
    }

    fn q(name: &str) -> QueueParams {
        QueueParams::new("test", name).unwrap()
    }

    #[tokio::test]
    async fn test_direct_routing() {
        let broker = setup().await;
        let router = broker.exchanges();
        router.create("events", ExchangeType::Direct).await.unwrap();
        router.bind("events", &q("orders"), Some("order.created")).await.unwrap();
        router.bind("events", &q("audit"), Some("order.created")).await.unwrap();

        assert_eq!(
            router.resolve("events", "order.created").await.unwrap(),
            vec![q("audit"), q("orders")]
        );
        assert!(router.resolve("events", "order.deleted").await.unwrap().is_empty());
        assert!(matches!(
            router.resolve("events", "order.*").await,
            Err(QueueError::InvalidRoutingKey(_))
        ));
    }

    #[tokio::test]
    async fn test_topic_routing() {
        let broker = setup().await;
        let router = broker.exchanges();
        router.create("topics", ExchangeType::Topic).await.unwrap();
        router.bind("topics", &q("orders"), Some("order.*")).await.unwrap();
        router.bind("topics", &q("audit"), Some("#")).await.unwrap();

        assert_eq!(
            router.resolve("topics", "order.paid").await.unwrap(),
            vec![q("audit"), q("orders")]
        );
        assert_eq!(
            router.resolve("topics", "user.signup").await.unwrap(),
            vec![q("audit")]
        );
    }

    #[tokio::test]
    async fn test_fanout_and_unbind() {
        let broker = setup().await;
        let router = broker.exchanges();
        router.create("all", ExchangeType::Fanout).await.unwrap();
        router.bind("all", &q("orders"), None).await.unwrap();
        router.bind("all", &q("audit"), None).await.unwrap();
        assert_eq!(router.resolve("all", "ignored").await.unwrap().len(), 2);
        assert_eq!(router.exchanges_of(&q("orders")).await.unwrap(), vec!["all"]);

        assert!(router.unbind("all", &q("orders"), None).await.unwrap());
        assert!(!router.unbind("all", &q("orders"), None).await.unwrap());
        assert_eq!(router.resolve("all", "x").await.unwrap(), vec![q("audit")]);
        assert!(router.exchanges_of(&q("orders")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_type_must_match() {
        let broker = setup().await;
        let router = broker.exchanges();
        router.create("events", ExchangeType::Direct).await.unwrap();
        router.bind("events", &q("orders"), Some("a")).await.unwrap();
        assert!(matches!(
            router.bind("events", &q("urgent"), Some("b")).await,
            Err(QueueError::ExchangeQueueTypeMismatch(_))
        ));

        // once empty, the exchange accepts another queue type
        router.unbind("events", &q("orders"), Some("a")).await.unwrap();
        router.bind("events", &q("urgent"), Some("b")).await.unwrap();
        assert_eq!(
            router.get("events").await.unwrap().queue_type,
            Some(QueueType::Priority)
        );
    }

    #[tokio::test]
    async fn test_exchange_errors() {
        let broker = setup().await;
        let router = broker.exchanges();
        router.create("events", ExchangeType::Direct).await.unwrap();
        router.create("events", ExchangeType::Direct).await.unwrap();
        assert!(matches!(
            router.create("events", ExchangeType::Topic).await,
            Err(QueueError::ExchangeTypeMismatch(_))
        ));
        assert!(matches!(
            router.bind("missing", &q("orders"), Some("a")).await,
            Err(QueueError::ExchangeNotFound(_))
        ));
        assert!(matches!(
            router.bind("events", &q("orders"), None).await,
            Err(QueueError::InvalidRoutingKey(_))
        ));

        router.bind("events", &q("orders"), Some("a")).await.unwrap();
        assert!(matches!(
            router.delete("events").await,
            Err(QueueError::ExchangeHasBoundQueues(_))
        ));
        assert!(matches!(
            broker.queues().delete(&q("orders")).await,
            Err(QueueError::QueueHasBindings(_))
        ));

        router.unbind("events", &q("orders"), Some("a")).await.unwrap();
        router.delete("events").await.unwrap();
        assert!(router.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_lists_bindings() {
        let broker = setup().await;
        let router = broker.exchanges();
        router.create("events", ExchangeType::Direct).await.unwrap();
        router.bind("events", &q("orders"), Some("a")).await.unwrap();
        router.bind("events", &q("orders"), Some("b")).await.unwrap();

        let exchange = router.get("events").await.unwrap();
        assert_eq!(exchange.bindings.len(), 2);
        assert_eq!(exchange.bindings["a"], vec![q("orders")]);

        // still bound through "b"
        router.unbind("events", &q("orders"), Some("a")).await.unwrap();
        assert_eq!(router.exchanges_of(&q("orders")).await.unwrap(), vec!["events"]);
    }
}
