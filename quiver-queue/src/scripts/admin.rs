//! Queue and consumer group administration.

use quiver_redis::{Arity, Keyspace, Reply, Script, ScriptCall, StoreResult};

use super::expect_ok;
use super::native::COUNTERS;
use crate::error::{QueueError, QueueResult};
use crate::keys::QueueKeys;
use crate::queue::{DeliveryModel, QueueParams, QueueType};

fn create_queue_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    if ks.exists(&keys[0]) {
        return Ok(Reply::status("QUEUE_EXISTS"));
    }
    let mut fields = vec![
        ("queueType", args[3].as_str()),
        ("deliveryModel", args[4].as_str()),
        ("state", "ACTIVE"),
        ("seq", "0"),
        ("createdAt", args[5].as_str()),
    ];
    fields.extend(COUNTERS.iter().map(|counter| (*counter, "0")));
    ks.hset_many(&keys[0], fields)?;
    ks.sadd(&keys[1], &args[0])?;
    ks.sadd(&keys[2], &args[1])?;
    ks.sadd(&keys[3], &args[2])?;
    Ok(Reply::ok())
}

fn delete_queue_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let Some(state) = ks.hget(&keys[0], "state")? else {
        return Ok(Reply::status("QUEUE_NOT_FOUND"));
    };
    if state == "LOCKED" {
        return Ok(Reply::status("QUEUE_LOCKED"));
    }
    let messages = super::native::field_num(ks, &keys[0], "messagesCount")?.unwrap_or(0);
    if messages > 0 || ks.zcard(&keys[7])? > 0 {
        return Ok(Reply::status("QUEUE_NOT_EMPTY"));
    }
    if ks.hlen(&keys[5])? > 0 {
        return Ok(Reply::status("QUEUE_HAS_ACTIVE_CONSUMERS"));
    }
    if ks.scard(&keys[6])? > 0 {
        return Ok(Reply::status("QUEUE_HAS_BINDINGS"));
    }
    for key in [&keys[0], &keys[4], &keys[5], &keys[7]] {
        ks.del(key);
    }
    ks.srem(&keys[1], &args[0])?;
    ks.srem(&keys[2], &args[1])?;
    if ks.scard(&keys[2])? == 0 {
        ks.srem(&keys[3], &args[2])?;
    }
    Ok(Reply::ok())
}

fn create_group_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    match ks.hget(&keys[0], "deliveryModel")?.as_deref() {
        None => return Ok(Reply::status("QUEUE_NOT_FOUND")),
        Some("PUB_SUB") => {}
        Some(_) => return Ok(Reply::status("CONSUMER_GROUPS_NOT_SUPPORTED")),
    }
    if !ks.sadd(&keys[1], &args[0])? {
        return Ok(Reply::status("CONSUMER_GROUP_EXISTS"));
    }
    Ok(Reply::ok())
}

fn delete_group_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    match ks.hget(&keys[0], "deliveryModel")?.as_deref() {
        None => return Ok(Reply::status("QUEUE_NOT_FOUND")),
        Some("PUB_SUB") => {}
        Some(_) => return Ok(Reply::status("CONSUMER_GROUPS_NOT_SUPPORTED")),
    }
    if !ks.sismember(&keys[1], &args[0])? {
        return Ok(Reply::status("CONSUMER_GROUP_NOT_FOUND"));
    }
    if ks.llen(&keys[2])? > 0
        || ks.zcard(&keys[3])? > 0
        || ks.zcard(&keys[4])? > 0
        || ks.llen(&keys[5])? > 0
    {
        return Ok(Reply::status("CONSUMER_GROUP_NOT_EMPTY"));
    }
    ks.srem(&keys[1], &args[0])?;
    Ok(Reply::ok())
}

/// KEYS: properties, queues index, namespace queues, namespaces.
/// ARGV: queue id, name, namespace, queue type, delivery model, now.
pub static CREATE_QUEUE: Script = Script {
    name: "create-queue",
    lua: include_str!("lua/create_queue.lua"),
    native: create_queue_native,
    keys: Arity::Fixed(4),
    args: Arity::Fixed(6),
};

/// KEYS: properties, queues index, namespace queues, namespaces, consumer
/// groups, processing registry, queue exchanges, messages index.
/// ARGV: queue id, name, namespace.
pub static DELETE_QUEUE: Script = Script {
    name: "delete-queue",
    lua: include_str!("lua/delete_queue.lua"),
    native: delete_queue_native,
    keys: Arity::Fixed(8),
    args: Arity::Fixed(3),
};

/// KEYS: properties, consumer groups. ARGV: group.
pub static CREATE_CONSUMER_GROUP: Script = Script {
    name: "create-consumer-group",
    lua: include_str!("lua/create_consumer_group.lua"),
    native: create_group_native,
    keys: Arity::Fixed(2),
    args: Arity::Fixed(1),
};

/// KEYS: properties, consumer groups, pending, priority pending, delayed,
/// requeued. ARGV: group.
pub static DELETE_CONSUMER_GROUP: Script = Script {
    name: "delete-consumer-group",
    lua: include_str!("lua/delete_consumer_group.lua"),
    native: delete_group_native,
    keys: Arity::Fixed(6),
    args: Arity::Fixed(1),
};

pub(crate) struct CreateQueue<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub queue_type: QueueType,
    pub delivery_model: DeliveryModel,
    pub now: i64,
}

impl ScriptCall for CreateQueue<'_> {
    type Output = ();
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &CREATE_QUEUE
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.queues_index(),
            self.keys.namespace_queues(&self.queue.ns),
            self.keys.namespaces(),
        ]
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.queue.to_string(),
            self.queue.name.clone(),
            self.queue.ns.clone(),
            self.queue_type.to_string(),
            self.delivery_model.to_string(),
            self.now.to_string(),
        ]
    }

    fn parse(&self, reply: Reply) -> QueueResult<()> {
        expect_ok(reply, &self.queue.to_string())
    }
}

pub(crate) struct DeleteQueue<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
}

impl ScriptCall for DeleteQueue<'_> {
    type Output = ();
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &DELETE_QUEUE
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.queues_index(),
            self.keys.namespace_queues(&self.queue.ns),
            self.keys.namespaces(),
            self.keys.consumer_groups(self.queue),
            self.keys.processing_registry(self.queue),
            self.keys.queue_exchanges(self.queue),
            self.keys.messages_index(self.queue),
        ]
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.queue.to_string(),
            self.queue.name.clone(),
            self.queue.ns.clone(),
        ]
    }

    fn parse(&self, reply: Reply) -> QueueResult<()> {
        expect_ok(reply, &self.queue.to_string())
    }
}

pub(crate) struct CreateConsumerGroup<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub group: &'a str,
}

impl ScriptCall for CreateConsumerGroup<'_> {
    type Output = ();
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &CREATE_CONSUMER_GROUP
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.consumer_groups(self.queue),
        ]
    }

    fn args(&self) -> Vec<String> {
        vec![self.group.to_string()]
    }

    fn parse(&self, reply: Reply) -> QueueResult<()> {
        match reply.token() {
            Some("QUEUE_NOT_FOUND") => Err(QueueError::QueueNotFound(self.queue.to_string())),
            _ => expect_ok(reply, self.group),
        }
    }
}

pub(crate) struct DeleteConsumerGroup<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub group: &'a str,
}

impl ScriptCall for DeleteConsumerGroup<'_> {
    type Output = ();
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &DELETE_CONSUMER_GROUP
    }

    fn keys(&self) -> Vec<String> {
        let group = Some(self.group);
        vec![
            self.keys.properties(self.queue),
            self.keys.consumer_groups(self.queue),
            self.keys.pending(self.queue, group),
            self.keys.priority_pending(self.queue, group),
            self.keys.delayed(self.queue, group),
            self.keys.requeued(self.queue, group),
        ]
    }

    fn args(&self) -> Vec<String> {
        vec![self.group.to_string()]
    }

    fn parse(&self, reply: Reply) -> QueueResult<()> {
        match reply.token() {
            Some("QUEUE_NOT_FOUND") => Err(QueueError::QueueNotFound(self.queue.to_string())),
            _ => expect_ok(reply, self.group),
        }
    }
}
