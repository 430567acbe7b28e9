//! Message management: requeue by id and delete.

use quiver_redis::{Arity, Keyspace, Reply, Script, ScriptCall, StoreError, StoreResult};

use super::expect_ok;
use super::native::{enqueue, incr, num, priority_arg, set_pairs};
use crate::error::{QueueError, QueueResult};
use crate::keys::QueueKeys;
use crate::message::MessagePriority;
use crate::queue::QueueParams;

fn requeue_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let (props, source, child) = (&keys[0], &keys[1], &keys[2]);
    let (child_id, now) = (&args[1], &args[2]);

    if !ks.exists(props) {
        return Ok(Reply::status("QUEUE_NOT_FOUND"));
    }
    let state = ks.hget(props, "state")?.unwrap_or_default();
    if state != "ACTIVE" {
        return Ok(Reply::Status(format!("QUEUE_{}", state)));
    }
    match ks.hget(source, "status")?.as_deref() {
        None => return Ok(Reply::status("MESSAGE_NOT_FOUND")),
        Some("ACKNOWLEDGED" | "DEAD_LETTERED") => {}
        Some(_) => return Ok(Reply::status("MESSAGE_NOT_REQUEUABLE")),
    }
    if ks.exists(child) {
        return Ok(Reply::status("MESSAGE_EXISTS"));
    }

    set_pairs(ks, child, &args[4..])?;
    ks.hset_many(child, [("status", "PENDING"), ("publishedAt", now.as_str())])?;
    enqueue(ks, props, &keys[3], &keys[4], child_id, priority_arg(&args[3])?)?;
    ks.zadd(&keys[5], num(now)?, child_id)?;
    incr(ks, props, "pendingCount", 1)?;
    incr(ks, props, "messagesCount", 1)?;

    if !ks.hexists(source, "requeuedAt")? {
        ks.hset(source, "requeuedAt", now)?;
    }
    ks.hset(source, "lastRequeuedAt", now)?;
    ks.hincrby(source, "requeueCount", 1)?;
    Ok(Reply::ok())
}

fn delete_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let mut results = Vec::new();
    for (i, id) in args.iter().enumerate() {
        let k = &keys[i * 10..(i + 1) * 10];
        let (props, record, index) = (&k[0], &k[1], &k[2]);
        let outcome = match ks.hget(record, "status")?.as_deref() {
            None => "MESSAGE_NOT_FOUND",
            Some("PROCESSING") => "MESSAGE_IN_PROCESS",
            Some(status) => {
                let removal = match status {
                    "PENDING" => Some((
                        "pendingCount",
                        ks.lrem(&k[3], 0, id)? + u64::from(ks.zrem(&k[4], id)?),
                    )),
                    "SCHEDULED" => Some(("scheduledCount", u64::from(ks.zrem(&k[5], id)?))),
                    "UNACK_DELAYING" => Some(("delayedCount", u64::from(ks.zrem(&k[6], id)?))),
                    "UNACK_REQUEUING" => Some(("requeuedCount", ks.lrem(&k[7], 0, id)?)),
                    "ACKNOWLEDGED" => {
                        Some(("acknowledgedCount", u64::from(ks.zrem(&k[8], id)?)))
                    }
                    "DEAD_LETTERED" => {
                        Some(("deadLetteredCount", u64::from(ks.zrem(&k[9], id)?)))
                    }
                    _ => None,
                };
                if let Some((counter, removed)) = removal
                    && removed > 0
                {
                    incr(ks, props, counter, -1)?;
                }
                ks.del(record);
                if ks.zrem(index, id)? {
                    incr(ks, props, "messagesCount", -1)?;
                }
                "OK"
            }
        };
        results.push(Reply::Array(vec![
            Reply::Bulk(id.clone()),
            Reply::Bulk(outcome.to_string()),
        ]));
    }
    Ok(Reply::Array(results))
}

/// KEYS: properties, source message, child message, pending, priority
/// pending, messages index.
/// ARGV: source id, child id, now, priority, then the child fields as pairs.
pub static REQUEUE_MESSAGE: Script = Script {
    name: "requeue-message",
    lua: include_str!("lua/requeue_message.lua"),
    native: requeue_native,
    keys: Arity::Fixed(6),
    args: Arity::Grouped {
        header: 4,
        group: 2,
    },
};

/// KEYS: per message: properties, message, messages index, pending,
/// priority pending, scheduled, delayed, requeued, acknowledged,
/// dead-lettered.
/// ARGV: per message: id.
pub static DELETE_MESSAGE: Script = Script {
    name: "delete-message",
    lua: include_str!("lua/delete_message.lua"),
    native: delete_native,
    keys: Arity::Grouped {
        header: 0,
        group: 10,
    },
    args: Arity::Grouped {
        header: 0,
        group: 1,
    },
};

/// Publish a fresh copy of a finished message.
pub(crate) struct RequeueMessage<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub group: Option<&'a str>,
    pub source_id: &'a str,
    pub child_id: &'a str,
    pub priority: Option<MessagePriority>,
    pub now: i64,
    pub fields: Vec<(String, String)>,
}

impl ScriptCall for RequeueMessage<'_> {
    type Output = ();
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &REQUEUE_MESSAGE
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.message(self.source_id),
            self.keys.message(self.child_id),
            self.keys.pending(self.queue, self.group),
            self.keys.priority_pending(self.queue, self.group),
            self.keys.messages_index(self.queue),
        ]
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.source_id.to_string(),
            self.child_id.to_string(),
            self.now.to_string(),
            self.priority
                .map(|p| p.value().to_string())
                .unwrap_or_default(),
        ];
        for (field, value) in &self.fields {
            args.push(field.clone());
            args.push(value.clone());
        }
        args
    }

    fn parse(&self, reply: Reply) -> QueueResult<()> {
        match reply.token() {
            Some(token) if token.starts_with("QUEUE_") => {
                expect_ok(reply, &self.queue.to_string())
            }
            Some("MESSAGE_EXISTS") => expect_ok(reply, self.child_id),
            _ => expect_ok(reply, self.source_id),
        }
    }
}

/// Where a message to delete lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeleteTarget {
    pub id: String,
    pub queue: QueueParams,
    pub group: Option<String>,
}

/// Result of deleting one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeleteOutcome {
    Deleted,
    NotFound,
    InProcess,
}

/// Delete messages in any state but processing.
pub(crate) struct DeleteMessages<'a> {
    pub keys: &'a QueueKeys,
    pub targets: &'a [DeleteTarget],
}

impl ScriptCall for DeleteMessages<'_> {
    type Output = Vec<(String, DeleteOutcome)>;
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &DELETE_MESSAGE
    }

    fn keys(&self) -> Vec<String> {
        self.targets
            .iter()
            .flat_map(|t| {
                let (q, group) = (&t.queue, t.group.as_deref());
                [
                    self.keys.properties(q),
                    self.keys.message(&t.id),
                    self.keys.messages_index(q),
                    self.keys.pending(q, group),
                    self.keys.priority_pending(q, group),
                    self.keys.scheduled(q),
                    self.keys.delayed(q, group),
                    self.keys.requeued(q, group),
                    self.keys.acknowledged(q),
                    self.keys.dead_lettered(q),
                ]
            })
            .collect()
    }

    fn args(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.id.clone()).collect()
    }

    fn parse(&self, reply: Reply) -> QueueResult<Self::Output> {
        reply
            .into_array()?
            .into_iter()
            .map(|row| {
                let fields = row
                    .into_array()?
                    .into_iter()
                    .map(Reply::into_string)
                    .collect::<StoreResult<Vec<_>>>()?;
                let [id, outcome] = <[String; 2]>::try_from(fields).map_err(|fields| {
                    StoreError::contract(format!("malformed delete row: {:?}", fields))
                })?;
                let outcome = match outcome.as_str() {
                    "OK" => DeleteOutcome::Deleted,
                    "MESSAGE_NOT_FOUND" => DeleteOutcome::NotFound,
                    "MESSAGE_IN_PROCESS" => DeleteOutcome::InProcess,
                    other => return Err(QueueError::from_token(other, &id)),
                };
                Ok((id, outcome))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_redis::{KeyScheme, MemoryStore, StoreExt};

    use crate::queue::{DeliveryModel, QueueType};
    use crate::scripts::{CreateQueue, FetchForProcessing, Publish};

    async fn setup() -> (MemoryStore, QueueKeys, QueueParams) {
        let store = MemoryStore::new();
        let keys = QueueKeys::new(KeyScheme::new("t"));
        let queue = QueueParams::new("test", "q").unwrap();
        store
            .call(&CreateQueue {
                keys: &keys,
                queue: &queue,
                queue_type: QueueType::Fifo,
                delivery_model: DeliveryModel::PointToPoint,
                now: 0,
            })
            .await
            .unwrap();
        for id in ["a", "b"] {
            store
                .call(&Publish {
                    keys: &keys,
                    queue: &queue,
                    group: None,
                    id,
                    priority: None,
                    scheduled_at: None,
                    now: 1,
                    fields: Vec::new(),
                })
                .await
                .unwrap();
        }
        (store, keys, queue)
    }

    #[tokio::test]
    async fn test_delete_outcomes() {
        let (store, keys, queue) = setup().await;
        store
            .call(&FetchForProcessing {
                keys: &keys,
                queue: &queue,
                group: None,
                consumer_id: "c1",
                now: 2,
            })
            .await
            .unwrap();

        let targets: Vec<_> = ["a", "b", "missing"]
            .into_iter()
            .map(|id| DeleteTarget {
                id: id.to_string(),
                queue: queue.clone(),
                group: None,
            })
            .collect();
        let results = store
            .call(&DeleteMessages {
                keys: &keys,
                targets: &targets,
            })
            .await
            .unwrap();
        assert_eq!(
            results,
            vec![
                ("a".to_string(), DeleteOutcome::InProcess),
                ("b".to_string(), DeleteOutcome::Deleted),
                ("missing".to_string(), DeleteOutcome::NotFound),
            ]
        );
        store.with_keyspace(|ks| {
            let props = keys.properties(&queue);
            assert_eq!(ks.hget(&props, "pendingCount").unwrap().as_deref(), Some("0"));
            assert_eq!(ks.hget(&props, "messagesCount").unwrap().as_deref(), Some("1"));
        });
    }

    #[tokio::test]
    async fn test_requeue_requires_finished_message() {
        let (store, keys, queue) = setup().await;
        let call = |source_id| RequeueMessage {
            keys: &keys,
            queue: &queue,
            group: None,
            source_id,
            child_id: "child",
            priority: None,
            now: 5,
            fields: Vec::new(),
        };
        let err = store.call(&call("a")).await.unwrap_err();
        assert!(matches!(err, QueueError::MessageNotRequeuable(_)));

        store.with_keyspace(|ks| {
            ks.hset(&keys.message("a"), "status", "ACKNOWLEDGED").unwrap();
        });
        store.call(&call("a")).await.unwrap();
        store.with_keyspace(|ks| {
            let source = keys.message("a");
            assert_eq!(ks.hget(&source, "requeueCount").unwrap().as_deref(), Some("1"));
            assert_eq!(ks.hget(&source, "requeuedAt").unwrap().as_deref(), Some("5"));
            assert_eq!(
                ks.hget(&keys.message("child"), "status").unwrap().as_deref(),
                Some("PENDING")
            );
        });

        let err = store.call(&call("a")).await.unwrap_err();
        assert!(matches!(err, QueueError::MessageAlreadyExists(id) if id == "child"));
    }

    #[tokio::test]
    async fn test_requeue_on_paused_queue() {
        let (store, keys, queue) = setup().await;
        store.with_keyspace(|ks| {
            ks.hset(&keys.properties(&queue), "state", "PAUSED").unwrap();
        });
        let err = store
            .call(&RequeueMessage {
                keys: &keys,
                queue: &queue,
                group: None,
                source_id: "a",
                child_id: "child",
                priority: None,
                now: 5,
                fields: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::QueuePaused(_)));
    }
}
