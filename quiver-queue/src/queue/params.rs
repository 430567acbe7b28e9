//! Queue identity and properties.

use quiver_redis::validate_name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{QueueError, QueueResult};

/// A namespaced queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueParams {
    /// Namespace.
    pub ns: String,
    /// Queue name.
    pub name: String,
}

impl QueueParams {
    /// Validate and normalize a queue address.
    pub fn new(ns: &str, name: &str) -> QueueResult<Self> {
        Ok(Self {
            ns: validate_name(ns)?,
            name: validate_name(name)?,
        })
    }

    /// Parse `name@ns`, or a bare `name` in `default_ns`.
    pub fn parse(raw: &str, default_ns: &str) -> QueueResult<Self> {
        match raw.split_once('@') {
            Some((name, ns)) => Self::new(ns, name),
            None => Self::new(default_ns, raw),
        }
    }
}

impl fmt::Display for QueueParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.ns)
    }
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Stored representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $ty {
            type Err = $crate::error::QueueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err($crate::error::QueueError::ContractViolation(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

/// Ordering of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueType {
    /// Oldest message first.
    Fifo,
    /// Newest message first.
    Lifo,
    /// Lowest priority value first, insertion order among equals.
    Priority,
}

string_enum!(QueueType {
    Fifo => "FIFO",
    Lifo => "LIFO",
    Priority => "PRIORITY",
});

/// Who receives a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryModel {
    /// One consumer receives each message.
    PointToPoint,
    /// Each consumer group receives its own copy.
    PubSub,
}

string_enum!(DeliveryModel {
    PointToPoint => "POINT_TO_POINT",
    PubSub => "PUB_SUB",
});

/// Operational state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    /// Everything permitted.
    Active,
    /// Publishing permitted; nothing is delivered; requeue rejected.
    Paused,
    /// Publishing rejected; nothing is delivered; requeue rejected.
    Stopped,
    /// Delivery permitted; requeue and deletion rejected.
    Locked,
}

string_enum!(QueueState {
    Active => "ACTIVE",
    Paused => "PAUSED",
    Stopped => "STOPPED",
    Locked => "LOCKED",
});

/// Per-status counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    /// Waiting for a consumer.
    pub pending: u64,
    /// Waiting for their delivery time.
    pub scheduled: u64,
    /// Waiting for a retry.
    pub delayed: u64,
    /// Waiting to be moved back to pending.
    pub requeued: u64,
    /// Held by consumers.
    pub processing: u64,
    /// Retained in the acknowledged audit store.
    pub acknowledged: u64,
    /// Retained in the dead-lettered audit store.
    pub dead_lettered: u64,
    /// Every stored message of the queue.
    pub messages: u64,
}

impl QueueCounters {
    /// Sum of the per-status counters; equals `messages` when consistent.
    pub fn in_storage(&self) -> u64 {
        self.pending
            + self.scheduled
            + self.delayed
            + self.requeued
            + self.processing
            + self.acknowledged
            + self.dead_lettered
    }
}

/// Stored queue properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueProperties {
    /// The queue.
    pub queue: QueueParams,
    /// Ordering.
    pub queue_type: QueueType,
    /// Delivery model.
    pub delivery_model: DeliveryModel,
    /// Operational state.
    pub state: QueueState,
    /// Creation time, epoch ms.
    pub created_at: i64,
    /// Counters.
    pub counters: QueueCounters,
}

impl QueueProperties {
    /// Decode the properties hash.
    pub(crate) fn from_fields(
        queue: QueueParams,
        fields: &HashMap<String, String>,
    ) -> QueueResult<Self> {
        let text = |name: &str| {
            fields.get(name).ok_or_else(|| {
                QueueError::ContractViolation(format!("queue {} lacks field '{}'", queue, name))
            })
        };
        let count = |name: &str| -> QueueResult<u64> {
            match fields.get(name) {
                None => Ok(0),
                Some(raw) => raw.parse::<i64>().map(|n| n.max(0) as u64).map_err(|_| {
                    QueueError::ContractViolation(format!("counter {} is '{}'", name, raw))
                }),
            }
        };
        let queue_type = match text("queueType")?.parse() {
            Ok(t) => t,
            Err(_) => return Err(QueueError::UnknownQueueType),
        };
        let delivery_model = text("deliveryModel")?.parse()?;
        let state = text("state")?.parse()?;
        let created_at = count("createdAt")? as i64;
        let counters = QueueCounters {
            pending: count("pendingCount")?,
            scheduled: count("scheduledCount")?,
            delayed: count("delayedCount")?,
            requeued: count("requeuedCount")?,
            processing: count("processingCount")?,
            acknowledged: count("acknowledgedCount")?,
            dead_lettered: count("deadLetteredCount")?,
            messages: count("messagesCount")?,
        };
        Ok(Self {
            queue,
            queue_type,
            delivery_model,
            state,
            created_at,
            counters,
        })
    }
}
