//! Delivery: fetch, acknowledge and unacknowledge.

use quiver_redis::{Arity, Keyspace, Reply, Script, ScriptCall, StoreError, StoreResult};
use std::str::FromStr;

use super::native::{evict, field_num, incr, num};
use super::{bool_arg, expect_ok};
use crate::config::MessageAuditConfig;
use crate::error::{QueueError, QueueResult};
use crate::keys::QueueKeys;
use crate::message::{DeadLetterReason, UnackAction, UnackReason};
use crate::queue::QueueParams;

fn fetch_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let props = &keys[0];
    let Some(qtype) = ks.hget(props, "queueType")? else {
        return Ok(Reply::status("QUEUE_NOT_FOUND"));
    };
    if matches!(ks.hget(props, "state")?.as_deref(), Some("PAUSED" | "STOPPED")) {
        return Ok(Reply::Nil);
    }
    let popped = match qtype.as_str() {
        "PRIORITY" => ks.zpopmin(&keys[2])?.map(|(id, _)| id),
        "LIFO" => ks.lpop(&keys[1])?,
        "FIFO" => ks.rpop(&keys[1])?,
        _ => return Ok(Reply::status("UNKNOWN_QUEUE_TYPE")),
    };
    let Some(id) = popped else {
        return Ok(Reply::Nil);
    };

    let (consumer, now) = (&args[0], &args[1]);
    let record = format!("{}{}", args[2], id);
    ks.lpush(&keys[3], &id)?;
    ks.hset(&keys[4], consumer, &keys[3])?;
    ks.hset_many(
        &record,
        [("status", "PROCESSING"), ("processingStartedAt", now.as_str())],
    )?;
    let ttl = field_num(ks, &record, "ttl")?.unwrap_or(0);
    let published = field_num(ks, &record, "publishedAt")?.unwrap_or(0);
    if ttl > 0 && num(now)? > published + ttl {
        ks.hset(&record, "expired", "1")?;
    }
    incr(ks, props, "pendingCount", -1)?;
    incr(ks, props, "processingCount", 1)?;
    Ok(Reply::Array(vec![Reply::Bulk(id)]))
}

fn acknowledge_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let (props, record) = (&keys[0], &keys[4]);
    let (id, now) = (&args[0], num(&args[1])?);
    if ks.lrem(&keys[1], 1, id)? == 0 {
        return Ok(Reply::status("MESSAGE_NOT_PROCESSING"));
    }
    incr(ks, props, "processingCount", -1)?;
    if args[2] == "1" {
        ks.hset_many(
            record,
            [("status", "ACKNOWLEDGED"), ("acknowledgedAt", args[1].as_str())],
        )?;
        ks.zadd(&keys[2], now, id)?;
        incr(ks, props, "acknowledgedCount", 1)?;
        evict(
            ks,
            props,
            &keys[2],
            "acknowledgedCount",
            &keys[3],
            &args[5],
            now,
            num(&args[3])?,
            num(&args[4])?,
        )?;
    } else {
        ks.del(record);
        ks.zrem(&keys[3], id)?;
        incr(ks, props, "messagesCount", -1)?;
    }
    Ok(Reply::ok())
}

fn row(id: &str, action: &str, reason: &str) -> Reply {
    Reply::Array(vec![
        Reply::Bulk(id.to_string()),
        Reply::Bulk(action.to_string()),
        Reply::Bulk(reason.to_string()),
    ])
}

fn unack_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let props = &keys[0];
    let (reason, now) = (&args[0], num(&args[1])?);
    let audit = args[2] == "1";
    let mut results = Vec::new();
    let mut dead = 0;

    for (i, id) in args[6..].iter().enumerate() {
        let base = 4 + i * 3;
        let (record, delayed, requeued) = (&keys[base], &keys[base + 1], &keys[base + 2]);

        if ks.lrem(&keys[1], 1, id)? == 0 {
            results.push(row(id, "SKIPPED", ""));
            continue;
        }
        incr(ks, props, "processingCount", -1)?;
        ks.hset(record, "unacknowledgedAt", &args[1])?;
        let expired = ks.hget(record, "expired")?.as_deref() == Some("1");
        let periodic = ks.hget(record, "periodic")?.as_deref() == Some("1");
        let attempts = field_num(ks, record, "attempts")?.unwrap_or(0);
        let threshold = field_num(ks, record, "retryThreshold")?.unwrap_or(3);
        let retry_delay = field_num(ks, record, "retryDelay")?.unwrap_or(0);

        let dl_reason = if reason == "TTL_EXPIRED" || expired {
            Some("TTL_EXPIRED")
        } else if periodic {
            Some("PERIODIC_MESSAGE")
        } else if attempts >= threshold {
            Some("RETRY_THRESHOLD_EXCEEDED")
        } else {
            None
        };

        if let Some(dl_reason) = dl_reason {
            if audit {
                ks.hset_many(
                    record,
                    [
                        ("status", "DEAD_LETTERED"),
                        ("deadLetteredAt", args[1].as_str()),
                        ("deadLetteredReason", dl_reason),
                    ],
                )?;
                ks.zadd(&keys[2], now, id)?;
                incr(ks, props, "deadLetteredCount", 1)?;
                dead += 1;
            } else {
                ks.del(record);
                ks.zrem(&keys[3], id)?;
                incr(ks, props, "messagesCount", -1)?;
            }
            results.push(row(id, "DEAD_LETTER", dl_reason));
        } else if retry_delay > 0 {
            ks.hincrby(record, "attempts", 1)?;
            ks.hset(record, "status", "UNACK_DELAYING")?;
            ks.zadd(delayed, now + retry_delay, id)?;
            incr(ks, props, "delayedCount", 1)?;
            results.push(row(id, "DELAY", ""));
        } else {
            ks.hincrby(record, "attempts", 1)?;
            ks.hset(record, "status", "UNACK_REQUEUING")?;
            ks.lpush(requeued, id)?;
            incr(ks, props, "requeuedCount", 1)?;
            results.push(row(id, "REQUEUE", ""));
        }
    }

    if dead > 0 {
        evict(
            ks,
            props,
            &keys[2],
            "deadLetteredCount",
            &keys[3],
            &args[5],
            now,
            num(&args[3])?,
            num(&args[4])?,
        )?;
    }
    Ok(Reply::Array(results))
}

/// KEYS: properties, pending, priority pending, processing, processing
/// registry. ARGV: consumer id, now, message key prefix.
pub static FETCH_FOR_PROCESSING: Script = Script {
    name: "fetch-for-processing",
    lua: include_str!("lua/fetch_for_processing.lua"),
    native: fetch_native,
    keys: Arity::Fixed(5),
    args: Arity::Fixed(3),
};

/// KEYS: properties, processing, acknowledged, messages index, message.
/// ARGV: id, now, audit enabled, audit max size, audit expire ms, message
/// key prefix.
pub static ACKNOWLEDGE: Script = Script {
    name: "acknowledge",
    lua: include_str!("lua/acknowledge.lua"),
    native: acknowledge_native,
    keys: Arity::Fixed(5),
    args: Arity::Fixed(6),
};

/// KEYS: properties, processing, dead-lettered, messages index, then per
/// message: message, delayed, requeued.
/// ARGV: reason, now, audit enabled, audit max size, audit expire ms,
/// message key prefix, then per message: id.
pub static HANDLE_UNACKNOWLEDGMENT: Script = Script {
    name: "handle-unacknowledgment",
    lua: include_str!("lua/handle_unacknowledgment.lua"),
    native: unack_native,
    keys: Arity::Grouped {
        header: 4,
        group: 3,
    },
    args: Arity::Grouped {
        header: 6,
        group: 1,
    },
};

fn audit_args(audit: &MessageAuditConfig) -> [String; 3] {
    [
        bool_arg(audit.enabled),
        audit.max_size.to_string(),
        audit.expire.as_millis().to_string(),
    ]
}

/// Move the next deliverable message into a consumer's processing list.
pub(crate) struct FetchForProcessing<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub group: Option<&'a str>,
    pub consumer_id: &'a str,
    pub now: i64,
}

impl ScriptCall for FetchForProcessing<'_> {
    type Output = Option<String>;
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &FETCH_FOR_PROCESSING
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.pending(self.queue, self.group),
            self.keys.priority_pending(self.queue, self.group),
            self.keys.processing(self.queue, self.consumer_id),
            self.keys.processing_registry(self.queue),
        ]
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.consumer_id.to_string(),
            self.now.to_string(),
            self.keys.message_prefix(),
        ]
    }

    fn parse(&self, reply: Reply) -> QueueResult<Option<String>> {
        match reply {
            Reply::Nil => Ok(None),
            Reply::Array(items) => match <[Reply; 1]>::try_from(items) {
                Ok([id]) => Ok(Some(id.into_string()?)),
                Err(items) => Err(QueueError::ContractViolation(format!(
                    "expected one message id, got {:?}",
                    items
                ))),
            },
            other => expect_ok(other, &self.queue.to_string()).and_then(|_| {
                Err(QueueError::ContractViolation(
                    "fetch replied OK without a message".into(),
                ))
            }),
        }
    }
}

/// Finish a message held by a consumer.
pub(crate) struct Acknowledge<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub consumer_id: &'a str,
    pub id: &'a str,
    pub now: i64,
    pub audit: &'a MessageAuditConfig,
}

impl ScriptCall for Acknowledge<'_> {
    type Output = ();
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &ACKNOWLEDGE
    }

    fn keys(&self) -> Vec<String> {
        vec![
            self.keys.properties(self.queue),
            self.keys.processing(self.queue, self.consumer_id),
            self.keys.acknowledged(self.queue),
            self.keys.messages_index(self.queue),
            self.keys.message(self.id),
        ]
    }

    fn args(&self) -> Vec<String> {
        let [enabled, max_size, expire] = audit_args(self.audit);
        vec![
            self.id.to_string(),
            self.now.to_string(),
            enabled,
            max_size,
            expire,
            self.keys.message_prefix(),
        ]
    }

    fn parse(&self, reply: Reply) -> QueueResult<()> {
        expect_ok(reply, self.id)
    }
}

/// One message to hand back, with the consumer group it was fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UnackTarget {
    pub id: String,
    pub group: Option<String>,
}

/// Give messages back from one processing list.
///
/// Messages no longer in the list are reported as skipped, so the same
/// batch can be retried safely.
pub(crate) struct HandleUnacknowledgment<'a> {
    pub keys: &'a QueueKeys,
    pub queue: &'a QueueParams,
    pub consumer_id: &'a str,
    pub reason: UnackReason,
    pub now: i64,
    pub audit: &'a MessageAuditConfig,
    pub targets: &'a [UnackTarget],
}

impl ScriptCall for HandleUnacknowledgment<'_> {
    type Output = Vec<(String, UnackAction)>;
    type Error = QueueError;

    fn script(&self) -> &'static Script {
        &HANDLE_UNACKNOWLEDGMENT
    }

    fn keys(&self) -> Vec<String> {
        let mut keys = vec![
            self.keys.properties(self.queue),
            self.keys.processing(self.queue, self.consumer_id),
            self.keys.dead_lettered(self.queue),
            self.keys.messages_index(self.queue),
        ];
        for target in self.targets {
            let group = target.group.as_deref();
            keys.push(self.keys.message(&target.id));
            keys.push(self.keys.delayed(self.queue, group));
            keys.push(self.keys.requeued(self.queue, group));
        }
        keys
    }

    fn args(&self) -> Vec<String> {
        let [enabled, max_size, expire] = audit_args(self.audit);
        let mut args = vec![
            self.reason.to_string(),
            self.now.to_string(),
            enabled,
            max_size,
            expire,
            self.keys.message_prefix(),
        ];
        args.extend(self.targets.iter().map(|t| t.id.clone()));
        args
    }

    fn parse(&self, reply: Reply) -> QueueResult<Self::Output> {
        if let Some(token) = reply.token() {
            return Err(QueueError::from_token(token, &self.queue.to_string()));
        }
        reply
            .into_array()?
            .into_iter()
            .map(parse_unack_row)
            .collect()
    }
}

fn parse_unack_row(row: Reply) -> QueueResult<(String, UnackAction)> {
    let fields = row
        .into_array()?
        .into_iter()
        .map(Reply::into_string)
        .collect::<StoreResult<Vec<_>>>()?;
    let [id, action, reason] = <[String; 3]>::try_from(fields).map_err(|fields| {
        StoreError::contract(format!("malformed unack row: {:?}", fields))
    })?;
    let action = match action.as_str() {
        "DEAD_LETTER" => UnackAction::DeadLetter(DeadLetterReason::from_str(&reason)?),
        "DELAY" => UnackAction::Delay,
        "REQUEUE" => UnackAction::Requeue,
        "SKIPPED" => UnackAction::Skipped,
        other => {
            return Err(QueueError::ContractViolation(format!(
                "unknown unack action '{}'",
                other
            )));
        }
    };
    Ok((id, action))
}
