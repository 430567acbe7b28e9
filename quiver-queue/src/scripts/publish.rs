use quiver_redis::{Arity, Keyspace, Reply, Script, ScriptCall, StoreResult};

use super::expect_ok;
use super::native::{enqueue, incr, num, priority_arg, set_pairs};
use crate::error::{QueueError, QueueResult};
use crate::keys::QueueKeys;
use crate::message::MessagePriority;
use crate::queue::QueueParams;

fn publish_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let (props, record) = (&keys[0], &keys[6]);
    let (id, group, priority) = (&args[0], &args[1], &args[2]);
    let scheduled_at = num(&args[3])?;
    let now = &args[4];

    let Some(qtype) = ks.hget(props, "queueType")? else {
        return Ok(Reply::status("QUEUE_NOT_FOUND"));
    };
    if ks.hget(props, "state")?.as_deref() == Some("STOPPED") {
        return Ok(Reply::status("QUEUE_STOPPED"));
    }
    if !matches!(qtype.as_str(), "FIFO" | "LIFO" | "PRIORITY") {
        return Ok(Reply::status("UNKNOWN_QUEUE_TYPE"));
    }
    if ks.hget(props, "deliveryModel")?.as_deref() == Some("PUB_SUB") {
        if group.is_empty() {
            return Ok(Reply::status("CONSUMER_GROUP_REQUIRED"));
        }
        if !ks.sismember(&keys[1], group)? {
            return Ok(Reply::status("CONSUMER_GROUP_NOT_FOUND"));
        }
    } else if !group.is_empty() {
        return Ok(Reply::status("CONSUMER_GROUPS_NOT_SUPPORTED"));
    }
    let is_priority = qtype == "PRIORITY";
    if is_priority && priority.is_empty() {
        return Ok(Reply::status("MESSAGE_PRIORITY_REQUIRED"));
    }
    if !is_priority && !priority.is_empty() {
        return Ok(Reply::status("PRIORITY_QUEUING_NOT_ENABLED"));
    }
    if ks.exists(record) {
        return Ok(Reply::status("MESSAGE_EXISTS"));
    }

    set_pairs(ks, record, &args[5..])?;
    if scheduled_at > 0 {
        ks.hset_many(record, [("status", "SCHEDULED"), ("scheduledAt", now.as_str())])?;
        ks.zadd(&keys[4], scheduled_at, id)?;
        incr(ks, props, "scheduledCount", 1)?;
    } else {
        ks.hset_many(record, [("status", "PENDING"), ("publishedAt", now.as_str())])?;
        enqueue(ks, props, &keys[2], &keys[3], id, priority_arg(priority)?)?;
        incr(ks, props, "pendingCount", 1)?;
    }
    ks.zadd(&keys[5], num(now)?, id)?;
    incr(ks, props, "messagesCount", 1)?;
    Ok(Reply::ok())
}

/// KEYS: properties, consumer groups, pending, priority pending, scheduled,
/// messages index, message.
/// ARGV: id, consumer group, priority, scheduled at, now, then the message
/// fields as pairs.
pub static PUBLISH: Script = Script {
    name: "publish",
    lua: include_str!("lua/publish.lua"),
    native: publish_native,
    keys: Arity::Fixed(7),
    args: Arity::Grouped {
        header: 5,
        group: 2,
    },
};

/// Store one message into one queue, or one consumer group of a pub-sub
/// queue.
pub(crate) struct Publish<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub group: Option<&'a str>,
    pub id: &'a str,
    pub priority: Option<MessagePriority>,
    pub scheduled_at: Option<i64>,
    pub now: i64,
    pub fields: Vec<(String, String)>,
}

impl ScriptCall for Publish<'_> {
    type Output = ();
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &PUBLISH
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.consumer_groups(self.queue),
            self.keys.pending(self.queue, self.group),
            self.keys.priority_pending(self.queue, self.group),
            self.keys.scheduled(self.queue),
            self.keys.messages_index(self.queue),
            self.keys.message(self.id),
        ]
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.id.to_string(),
            self.group.unwrap_or_default().to_string(),
            self.priority
                .map(|p| p.value().to_string())
                .unwrap_or_default(),
            self.scheduled_at.unwrap_or(0).to_string(),
            self.now.to_string(),
        ];
        for (field, value) in &self.fields {
            args.push(field.clone());
            args.push(value.clone());
        }
        args
    }

    fn parse(&self, reply: Reply) -> QueueResult<()> {
        match reply.token() {
            Some("QUEUE_NOT_FOUND" | "QUEUE_STOPPED") => expect_ok(reply, &self.queue.to_string()),
            Some("CONSUMER_GROUP_REQUIRED") => {
                Err(QueueError::ConsumerGroupsRequired(self.queue.to_string()))
            }
            Some("CONSUMER_GROUP_NOT_FOUND") => Err(QueueError::ConsumerGroupNotFound(
                self.group.unwrap_or_default().to_string(),
            )),
            Some("CONSUMER_GROUPS_NOT_SUPPORTED" | "UNKNOWN_QUEUE_TYPE") => {
                expect_ok(reply, &self.queue.to_string())
            }
            _ => expect_ok(reply, self.id),
        }
    }
}
