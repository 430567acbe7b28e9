//! Broker key layout on top of the shared [`KeyScheme`].

use quiver_redis::{GLOBAL_NAMESPACE, KeyScheme, KeyType};

use crate::queue::QueueParams;

/// Derives every key the broker touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    scheme: KeyScheme,
}

impl QueueKeys {
    /// Wrap a key scheme.
    pub fn new(scheme: KeyScheme) -> Self {
        Self { scheme }
    }

    /// The underlying scheme.
    pub fn scheme(&self) -> &KeyScheme {
        &self.scheme
    }

    fn queue_key(&self, queue: &QueueParams, kind: KeyType, group: Option<&str>) -> String {
        match group {
            Some(group) => self.scheme.key(&queue.ns, kind, &queue.name, &[group]),
            None => self.scheme.key(&queue.ns, kind, &queue.name, &[]),
        }
    }

    /// Queue properties hash.
    pub fn properties(&self, queue: &QueueParams) -> String {
        self.queue_key(queue, KeyType::Properties, None)
    }

    /// Pending list of a FIFO/LIFO queue, per consumer group for pub-sub.
    pub fn pending(&self, queue: &QueueParams, group: Option<&str>) -> String {
        self.queue_key(queue, KeyType::Pending, group)
    }

    /// Pending sorted set of a priority queue.
    pub fn priority_pending(&self, queue: &QueueParams, group: Option<&str>) -> String {
        self.queue_key(queue, KeyType::PriorityPending, group)
    }

    /// Delayed sorted set.
    pub fn delayed(&self, queue: &QueueParams, group: Option<&str>) -> String {
        self.queue_key(queue, KeyType::Delayed, group)
    }

    /// Requeued list.
    pub fn requeued(&self, queue: &QueueParams, group: Option<&str>) -> String {
        self.queue_key(queue, KeyType::Requeued, group)
    }

    /// Scheduled sorted set.
    pub fn scheduled(&self, queue: &QueueParams) -> String {
        self.queue_key(queue, KeyType::Scheduled, None)
    }

    /// Acknowledged audit sorted set.
    pub fn acknowledged(&self, queue: &QueueParams) -> String {
        self.queue_key(queue, KeyType::Acknowledged, None)
    }

    /// Dead-lettered audit sorted set.
    pub fn dead_lettered(&self, queue: &QueueParams) -> String {
        self.queue_key(queue, KeyType::DeadLettered, None)
    }

    /// Every message id of a queue, scored by creation time.
    pub fn messages_index(&self, queue: &QueueParams) -> String {
        self.queue_key(queue, KeyType::MessagesIndex, None)
    }

    /// Consumer groups of a pub-sub queue.
    pub fn consumer_groups(&self, queue: &QueueParams) -> String {
        self.queue_key(queue, KeyType::ConsumerGroups, None)
    }

    /// Consumer id to processing list key.
    pub fn processing_registry(&self, queue: &QueueParams) -> String {
        self.queue_key(queue, KeyType::ProcessingRegistry, None)
    }

    /// Processing list of one consumer.
    pub fn processing(&self, queue: &QueueParams, consumer_id: &str) -> String {
        self.queue_key(queue, KeyType::Processing, Some(consumer_id))
    }

    /// Exchanges a queue is bound to.
    pub fn queue_exchanges(&self, queue: &QueueParams) -> String {
        self.queue_key(queue, KeyType::QueueExchanges, None)
    }

    /// Consumer heartbeat.
    pub fn heartbeat(&self, consumer_id: &str) -> String {
        self.scheme.global(KeyType::Heartbeat, consumer_id)
    }

    /// Message record hash.
    pub fn message(&self, id: &str) -> String {
        self.scheme.global(KeyType::Message, id)
    }

    /// Prefix that turns a message id into its record key.
    pub fn message_prefix(&self) -> String {
        self.scheme.kind_prefix(GLOBAL_NAMESPACE, KeyType::Message)
    }

    /// Every queue, as `name@ns`.
    pub fn queues_index(&self) -> String {
        self.scheme.global(KeyType::Queues, "_index")
    }

    /// Queue names of one namespace.
    pub fn namespace_queues(&self, ns: &str) -> String {
        self.scheme.key(ns, KeyType::Queues, "_index", &[])
    }

    /// Every namespace.
    pub fn namespaces(&self) -> String {
        self.scheme.global(KeyType::Namespaces, "_index")
    }

    /// Exchange metadata hash.
    pub fn exchange(&self, name: &str) -> String {
        self.scheme.global(KeyType::Exchanges, name)
    }

    /// Every exchange name.
    pub fn exchanges_index(&self) -> String {
        self.scheme.global(KeyType::Exchanges, "_index")
    }

    /// Queue id to number of bindings on an exchange.
    pub fn exchange_queues(&self, name: &str) -> String {
        self.scheme
            .key(GLOBAL_NAMESPACE, KeyType::Exchanges, name, &["queues"])
    }

    /// Binding keys in use on an exchange.
    pub fn exchange_binding_keys(&self, name: &str) -> String {
        self.scheme
            .key(GLOBAL_NAMESPACE, KeyType::Exchanges, name, &["keys"])
    }

    /// Queues bound under one binding key.
    pub fn exchange_binding(&self, name: &str, binding_key: &str) -> String {
        self.scheme.key(
            GLOBAL_NAMESPACE,
            KeyType::ExchangeBindings,
            name,
            &[binding_key],
        )
    }

    /// Lock backing a single-active-instance role.
    pub fn role_lock(&self, role: &str) -> String {
        self.scheme
            .key(GLOBAL_NAMESPACE, KeyType::Locks, "role", &[role])
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(KeyScheme::default())
    }
}
