//! Moving waiting messages back to pending.

use quiver_redis::{Arity, Keyspace, Reply, Script, ScriptCall, StoreResult};

use super::native::{enqueue, field_num, incr, num, priority_arg, set_pairs};
use super::{expect_count, expect_ok};
use crate::error::{QueueError, QueueResult};
use crate::keys::QueueKeys;
use crate::message::MessagePriority;
use crate::queue::QueueParams;

fn promote_delayed_native(
    ks: &mut Keyspace,
    keys: &[String],
    args: &[String],
) -> StoreResult<Reply> {
    let props = &keys[0];
    let now = num(&args[0])?;
    let mut moved = 0;
    for id in &args[2..] {
        let due = ks.zscore(&keys[1], id)?.is_some_and(|score| score <= now);
        if !due {
            continue;
        }
        let record = format!("{}{}", args[1], id);
        ks.zrem(&keys[1], id)?;
        let priority = field_num(ks, &record, "priority")?;
        enqueue(ks, props, &keys[2], &keys[3], id, priority)?;
        ks.hset_many(
            &record,
            [("status", "PENDING"), ("lastRetriedAttemptAt", args[0].as_str())],
        )?;
        if !ks.hexists(&record, "publishedAt")? {
            ks.hset(&record, "publishedAt", &args[0])?;
        }
        incr(ks, props, "delayedCount", -1)?;
        incr(ks, props, "pendingCount", 1)?;
        moved += 1;
    }
    Ok(Reply::Int(moved))
}

fn promote_requeued_native(
    ks: &mut Keyspace,
    keys: &[String],
    args: &[String],
) -> StoreResult<Reply> {
    let props = &keys[0];
    let batch = num(&args[0])?;
    let mut moved = 0;
    while moved < batch {
        let Some(id) = ks.rpop(&keys[1])? else {
            break;
        };
        let record = format!("{}{}", args[2], id);
        let priority = field_num(ks, &record, "priority")?;
        enqueue(ks, props, &keys[2], &keys[3], &id, priority)?;
        ks.hset_many(
            &record,
            [("status", "PENDING"), ("lastRetriedAttemptAt", args[1].as_str())],
        )?;
        incr(ks, props, "requeuedCount", -1)?;
        incr(ks, props, "pendingCount", 1)?;
        moved += 1;
    }
    Ok(Reply::Int(moved))
}

fn promote_scheduled_native(
    ks: &mut Keyspace,
    keys: &[String],
    args: &[String],
) -> StoreResult<Reply> {
    let (props, parent) = (&keys[0], &keys[5]);
    let (parent_id, now, mode) = (&args[0], &args[1], &args[2]);
    let next_at = num(&args[3])?;
    let priority = priority_arg(&args[5])?;

    let due = ks
        .zscore(&keys[1], parent_id)?
        .map(|score| num(now).map(|now| score <= now))
        .transpose()?
        .unwrap_or(false);
    if !due {
        return Ok(Reply::status("SKIPPED"));
    }

    if mode == "IN_PLACE" {
        ks.zrem(&keys[1], parent_id)?;
        enqueue(ks, props, &keys[2], &keys[3], parent_id, priority)?;
        ks.hset_many(parent, [("status", "PENDING"), ("lastScheduledAt", now.as_str())])?;
        if !ks.hexists(parent, "publishedAt")? {
            ks.hset(parent, "publishedAt", now)?;
        }
        ks.hincrby(parent, "scheduledTimes", 1)?;
        incr(ks, props, "scheduledCount", -1)?;
        incr(ks, props, "pendingCount", 1)?;
        return Ok(Reply::ok());
    }

    let (child_id, child) = (&args[4], &keys[6]);
    if ks.exists(child) {
        return Ok(Reply::status("MESSAGE_EXISTS"));
    }
    set_pairs(ks, child, &args[7..])?;
    ks.hset_many(child, [("status", "PENDING"), ("publishedAt", now.as_str())])?;
    enqueue(ks, props, &keys[2], &keys[3], child_id, priority)?;
    ks.zadd(&keys[4], num(now)?, child_id)?;
    incr(ks, props, "pendingCount", 1)?;
    incr(ks, props, "messagesCount", 1)?;

    ks.hset_many(
        parent,
        [("lastScheduledAt", now.as_str()), ("scheduledRepeatCount", args[6].as_str())],
    )?;
    ks.hincrby(parent, "scheduledTimes", 1)?;
    if next_at > 0 {
        ks.zadd(&keys[1], next_at, parent_id)?;
    } else {
        ks.zrem(&keys[1], parent_id)?;
        ks.zrem(&keys[4], parent_id)?;
        ks.del(parent);
        incr(ks, props, "scheduledCount", -1)?;
        incr(ks, props, "messagesCount", -1)?;
    }
    Ok(Reply::ok())
}

/// KEYS: properties, delayed, pending, priority pending.
/// ARGV: now, message key prefix, then ids.
pub static PROMOTE_DELAYED: Script = Script {
    name: "promote-delayed",
    lua: include_str!("lua/promote_delayed.lua"),
    native: promote_delayed_native,
    keys: Arity::Fixed(4),
    args: Arity::Grouped {
        header: 2,
        group: 1,
    },
};

/// KEYS: properties, requeued, pending, priority pending.
/// ARGV: batch size, now, message key prefix.
pub static PROMOTE_REQUEUED: Script = Script {
    name: "promote-requeued",
    lua: include_str!("lua/promote_requeued.lua"),
    native: promote_requeued_native,
    keys: Arity::Fixed(4),
    args: Arity::Fixed(3),
};

/// KEYS: properties, scheduled, pending, priority pending, messages index,
/// parent message, child message.
/// ARGV: parent id, now, mode, next fire at, child id, priority, repeat
/// position, then the child fields as pairs.
pub static PROMOTE_SCHEDULED: Script = Script {
    name: "promote-scheduled",
    lua: include_str!("lua/promote_scheduled.lua"),
    native: promote_scheduled_native,
    keys: Arity::Fixed(7),
    args: Arity::Grouped {
        header: 7,
        group: 2,
    },
};

/// Move due members of a delayed set to pending.
pub(crate) struct PromoteDelayed<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub group: Option<&'a str>,
    pub now: i64,
    pub ids: &'a [String],
}

impl ScriptCall for PromoteDelayed<'_> {
    type Output = u64;
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &PROMOTE_DELAYED
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.delayed(self.queue, self.group),
            self.keys.pending(self.queue, self.group),
            self.keys.priority_pending(self.queue, self.group),
        ]
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![self.now.to_string(), self.keys.message_prefix()];
        args.extend(self.ids.iter().cloned());
        args
    }

    fn parse(&self, reply: Reply) -> QueueResult<u64> {
        expect_count(reply, &self.queue.to_string())
    }
}

/// Move up to `batch` messages from a requeued list to pending.
pub(crate) struct PromoteRequeued<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub group: Option<&'a str>,
    pub batch: usize,
    pub now: i64,
}

impl ScriptCall for PromoteRequeued<'_> {
    type Output = u64;
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &PROMOTE_REQUEUED
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.requeued(self.queue, self.group),
            self.keys.pending(self.queue, self.group),
            self.keys.priority_pending(self.queue, self.group),
        ]
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.batch.to_string(),
            self.now.to_string(),
            self.keys.message_prefix(),
        ]
    }

    fn parse(&self, reply: Reply) -> QueueResult<u64> {
        expect_count(reply, &self.queue.to_string())
    }
}

/// How a due scheduled message is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScheduleMode {
    /// A one-shot delayed message moves to pending itself.
    InPlace,
    /// A periodic message spawns a child and is rescheduled at `next_at`,
    /// or removed after its last firing.
    Child {
        id: String,
        fields: Vec<(String, String)>,
        next_at: Option<i64>,
        repeat_position: u32,
    },
}

/// Deliver one due scheduled message.
///
/// Parses to `false` when the message was no longer due or present.
pub(crate) struct PromoteScheduled<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub group: Option<&'a str>,
    pub parent_id: &'a str,
    pub priority: Option<MessagePriority>,
    pub now: i64,
    pub mode: ScheduleMode,
}

impl ScriptCall for PromoteScheduled<'_> {
    type Output = bool;
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &PROMOTE_SCHEDULED
    }

    fn keys(&self) -> Vec<String> {
        let child = match &self.mode {
            ScheduleMode::InPlace => self.parent_id,
            ScheduleMode::Child { id, .. } => id.as_str(),
        };
        vec![
            self.keys.properties(self.queue),
            self.keys.scheduled(self.queue),
            self.keys.pending(self.queue, self.group),
            self.keys.priority_pending(self.queue, self.group),
            self.keys.messages_index(self.queue),
            self.keys.message(self.parent_id),
            self.keys.message(child),
        ]
    }

    fn args(&self) -> Vec<String> {
        let priority = self
            .priority
            .map(|p| p.value().to_string())
            .unwrap_or_default();
        let mut args = vec![self.parent_id.to_string(), self.now.to_string()];
        match &self.mode {
            ScheduleMode::InPlace => {
                args.extend(["IN_PLACE".into(), "0".into(), String::new(), priority]);
                args.push("0".into());
            }
            ScheduleMode::Child {
                id,
                fields,
                next_at,
                repeat_position,
            } => {
                args.extend([
                    "CHILD".into(),
                    next_at.unwrap_or(0).to_string(),
                    id.clone(),
                    priority,
                    repeat_position.to_string(),
                ]);
                for (field, value) in fields {
                    args.push(field.clone());
                    args.push(value.clone());
                }
            }
        }
        args
    }

    fn parse(&self, reply: Reply) -> QueueResult<bool> {
        match reply.token() {
            Some("SKIPPED") => Ok(false),
            _ => expect_ok(reply, self.parent_id).map(|_| true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_redis::{KeyScheme, MemoryStore, StoreExt};

    use crate::queue::{DeliveryModel, QueueType};
    use crate::scripts::{CreateQueue, Publish};

    async fn setup(queue_type: QueueType) -> (MemoryStore, QueueKeys, QueueParams) {
        let store = MemoryStore::new();
        let keys = QueueKeys::new(KeyScheme::new("t"));
        let queue = QueueParams::new("test", "q").unwrap();
        store
            .call(&CreateQueue {
                keys: &keys,
                queue: &queue,
                queue_type,
                delivery_model: DeliveryModel::PointToPoint,
                now: 0,
            })
            .await
            .unwrap();
        (store, keys, queue)
    }

    fn count(store: &MemoryStore, keys: &QueueKeys, queue: &QueueParams, field: &str) -> String {
        store.with_keyspace(|ks| {
            ks.hget(&keys.properties(queue), field)
                .unwrap()
                .unwrap_or_default()
        })
    }

    #[tokio::test]
    async fn test_promote_delayed_only_due() {
        let (store, keys, queue) = setup(QueueType::Fifo).await;
        store.with_keyspace(|ks| {
            ks.zadd(&keys.delayed(&queue, None), 100, "due").unwrap();
            ks.zadd(&keys.delayed(&queue, None), 900, "later").unwrap();
            ks.hset(&keys.properties(&queue), "delayedCount", "2").unwrap();
        });
        let ids = vec!["due".to_string(), "later".to_string(), "gone".to_string()];
        let moved = store
            .call(&PromoteDelayed {
                keys: &keys,
                queue: &queue,
                group: None,
                now: 500,
                ids: &ids,
            })
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(count(&store, &keys, &queue, "delayedCount"), "1");
        assert_eq!(count(&store, &keys, &queue, "pendingCount"), "1");
        store.with_keyspace(|ks| {
            assert_eq!(
                ks.hget(&keys.message("due"), "publishedAt").unwrap().as_deref(),
                Some("500")
            );
        });
    }

    #[tokio::test]
    async fn test_promote_requeued_batch() {
        let (store, keys, queue) = setup(QueueType::Fifo).await;
        store.with_keyspace(|ks| {
            for id in ["a", "b", "c"] {
                ks.lpush(&keys.requeued(&queue, None), id).unwrap();
            }
        });
        let call = PromoteRequeued {
            keys: &keys,
            queue: &queue,
            group: None,
            batch: 2,
            now: 10,
        };
        assert_eq!(store.call(&call).await.unwrap(), 2);
        assert_eq!(store.call(&call).await.unwrap(), 1);
        assert_eq!(store.call(&call).await.unwrap(), 0);
        store.with_keyspace(|ks| {
            // oldest requeued message is delivered first
            assert_eq!(ks.rpop(&keys.pending(&queue, None)).unwrap().as_deref(), Some("a"));
        });
    }

    #[tokio::test]
    async fn test_promote_scheduled_child_then_last() {
        let (store, keys, queue) = setup(QueueType::Fifo).await;
        store
            .call(&Publish {
                keys: &keys,
                queue: &queue,
                group: None,
                id: "parent",
                priority: None,
                scheduled_at: Some(100),
                now: 0,
                fields: vec![("periodic".into(), "0".into())],
            })
            .await
            .unwrap();

        let child = |id: &str, next_at| PromoteScheduled {
            keys: &keys,
            queue: &queue,
            group: None,
            parent_id: "parent",
            priority: None,
            now: 100,
            mode: ScheduleMode::Child {
                id: id.to_string(),
                fields: vec![("periodic".into(), "1".into())],
                next_at,
                repeat_position: 0,
            },
        };
        assert!(store.call(&child("c1", Some(100))).await.unwrap());
        assert_eq!(count(&store, &keys, &queue, "messagesCount"), "2");
        assert_eq!(count(&store, &keys, &queue, "scheduledCount"), "1");

        assert!(store.call(&child("c2", None)).await.unwrap());
        assert_eq!(count(&store, &keys, &queue, "messagesCount"), "2");
        assert_eq!(count(&store, &keys, &queue, "scheduledCount"), "0");
        assert!(!store.call(&child("c3", None)).await.unwrap());
        store.with_keyspace(|ks| assert!(!ks.exists(&keys.message("parent"))));
    }

    #[tokio::test]
    async fn test_promote_scheduled_in_place() {
        let (store, keys, queue) = setup(QueueType::Fifo).await;
        store
            .call(&Publish {
                keys: &keys,
                queue: &queue,
                group: None,
                id: "m",
                priority: None,
                scheduled_at: Some(100),
                now: 0,
                fields: Vec::new(),
            })
            .await
            .unwrap();
        let call = |now| PromoteScheduled {
            keys: &keys,
            queue: &queue,
            group: None,
            parent_id: "m",
            priority: None,
            now,
            mode: ScheduleMode::InPlace,
        };
        assert!(!store.call(&call(50)).await.unwrap());
        assert!(store.call(&call(100)).await.unwrap());
        assert_eq!(count(&store, &keys, &queue, "pendingCount"), "1");
        assert_eq!(count(&store, &keys, &queue, "scheduledCount"), "0");
    }
}
