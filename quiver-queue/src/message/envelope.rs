//! The message entity and its flat hash encoding.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::schedule::{CronSchedule, MessageSchedule};
use super::state::{MessageState, MessageStatus};
use crate::error::{QueueError, QueueResult};
use crate::queue::QueueParams;

/// Default retry threshold.
pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;

/// Default retry delay in ms.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 60_000;

/// Message priority. Lower values are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessagePriority {
    Highest = 0,
    VeryHigh = 1,
    High = 2,
    AboveNormal = 3,
    Normal = 4,
    BelowNormal = 5,
    Low = 6,
    Lowest = 7,
}

impl MessagePriority {
    /// Numeric value.
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Priority for a numeric value.
    pub fn from_value(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Highest,
            1 => Self::VeryHigh,
            2 => Self::High,
            3 => Self::AboveNormal,
            4 => Self::Normal,
            5 => Self::BelowNormal,
            6 => Self::Low,
            7 => Self::Lowest,
            _ => return None,
        })
    }
}

/// A message: immutable envelope plus mutable [`MessageState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Message id.
    pub id: String,
    /// Destination queue. Unset when publishing through an exchange.
    pub destination: Option<QueueParams>,
    /// Consumer group of a pub-sub queue.
    pub consumer_group_id: Option<String>,
    /// Priority, required by priority queues.
    pub priority: Option<MessagePriority>,
    /// Payload.
    pub payload: serde_json::Value,
    /// Time to live in ms (0 = none).
    pub ttl: u64,
    /// Failed deliveries retried before dead-lettering.
    pub retry_threshold: u32,
    /// Delay before a retry in ms (0 = requeue immediately).
    pub retry_delay: u64,
    /// Handler time limit in ms (0 = none).
    pub consume_timeout: u64,
    /// Delivery schedule.
    pub schedule: MessageSchedule,
    /// Exchange the message was routed through.
    pub exchange: Option<String>,
    /// Routing key used with the exchange.
    pub routing_key: Option<String>,
    /// Creation time, epoch ms.
    pub created_at: i64,
    /// Mutable state.
    pub state: MessageState,
}

impl MessageEnvelope {
    /// Create a message with a fresh id.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            destination: None,
            consumer_group_id: None,
            priority: None,
            payload,
            ttl: 0,
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
            retry_delay: DEFAULT_RETRY_DELAY_MS,
            consume_timeout: 0,
            schedule: MessageSchedule::default(),
            exchange: None,
            routing_key: None,
            created_at: 0,
            state: MessageState::default(),
        }
    }

    /// Serialize a payload into a new message.
    pub fn from_payload<T: Serialize>(payload: &T) -> QueueResult<Self> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    /// Use a caller-chosen id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Send to a queue.
    pub fn to_queue(mut self, queue: QueueParams) -> Self {
        self.destination = Some(queue);
        self
    }

    /// Send through an exchange.
    pub fn to_exchange(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Target one consumer group of a pub-sub queue.
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group_id = Some(group.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the time to live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.as_millis() as u64;
        self
    }

    /// Set the retry threshold.
    pub fn with_retry_threshold(mut self, threshold: u32) -> Self {
        self.retry_threshold = threshold;
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay.as_millis() as u64;
        self
    }

    /// Set the handler time limit.
    pub fn with_consume_timeout(mut self, timeout: Duration) -> Self {
        self.consume_timeout = timeout.as_millis() as u64;
        self
    }

    /// Delay the first delivery.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.schedule.delay = delay.as_millis() as u64;
        self
    }

    /// Fire on a cron schedule.
    pub fn with_cron(mut self, expression: &str) -> QueueResult<Self> {
        CronSchedule::parse(expression)?;
        self.schedule.cron = Some(expression.to_string());
        Ok(self)
    }

    /// Fire `count` extra times, `period` apart.
    pub fn with_repeat(mut self, count: u32, period: Duration) -> Self {
        self.schedule.repeat = count;
        self.schedule.repeat_period = period.as_millis() as u64;
        self
    }

    /// Deserialize the payload.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Destination queue, required once the message is stored.
    pub fn queue(&self) -> QueueResult<&QueueParams> {
        self.destination
            .as_ref()
            .ok_or(QueueError::MessageDestinationRequired)
    }

    fn child(&self, id: String) -> Self {
        Self {
            id,
            destination: self.destination.clone(),
            consumer_group_id: self.consumer_group_id.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
            ttl: self.ttl,
            retry_threshold: self.retry_threshold,
            retry_delay: self.retry_delay,
            consume_timeout: self.consume_timeout,
            schedule: MessageSchedule::default(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            created_at: 0,
            state: MessageState::default(),
        }
    }

    /// A firing of this scheduled message.
    pub fn scheduled_child(&self, created_at: i64) -> Self {
        let mut child = self.child(Uuid::new_v4().to_string());
        child.created_at = created_at;
        child.state.periodic = true;
        child.state.scheduled_message_parent_id = Some(self.id.clone());
        child
    }

    /// A fresh copy of this finished message. The schedule is not carried.
    pub fn requeued_child(&self, created_at: i64) -> Self {
        let mut child = self.child(Uuid::new_v4().to_string());
        child.created_at = created_at;
        child.state.requeued_message_parent_id = Some(self.id.clone());
        child
    }

    /// Encode as hash fields.
    pub fn to_fields(&self) -> QueueResult<Vec<(String, String)>> {
        let queue = self.queue()?;
        let mut fields = FieldWriter::default();
        fields.put("id", &self.id);
        fields.put("queueNs", &queue.ns);
        fields.put("queueName", &queue.name);
        fields.opt("consumerGroupId", self.consumer_group_id.as_deref());
        fields.opt("priority", self.priority.map(|p| p.value()));
        fields.put("payload", serde_json::to_string(&self.payload)?);
        fields.put("ttl", self.ttl);
        fields.put("retryThreshold", self.retry_threshold);
        fields.put("retryDelay", self.retry_delay);
        fields.put("consumeTimeout", self.consume_timeout);
        fields.put("delay", self.schedule.delay);
        fields.opt("cron", self.schedule.cron.as_deref());
        fields.put("repeat", self.schedule.repeat);
        fields.put("repeatPeriod", self.schedule.repeat_period);
        fields.opt("exchange", self.exchange.as_deref());
        fields.opt("routingKey", self.routing_key.as_deref());
        fields.put("createdAt", self.created_at);

        let state = &self.state;
        fields.put("status", state.status);
        fields.opt("publishedAt", state.published_at);
        fields.opt("scheduledAt", state.scheduled_at);
        fields.opt("lastScheduledAt", state.last_scheduled_at);
        fields.opt("processingStartedAt", state.processing_started_at);
        fields.opt("acknowledgedAt", state.acknowledged_at);
        fields.opt("unacknowledgedAt", state.unacknowledged_at);
        fields.opt("deadLetteredAt", state.dead_lettered_at);
        fields.opt("deadLetteredReason", state.dead_lettered_reason);
        fields.opt("requeuedAt", state.requeued_at);
        fields.opt("lastRequeuedAt", state.last_requeued_at);
        fields.opt("lastRetriedAttemptAt", state.last_retried_attempt_at);
        fields.put("attempts", state.attempts);
        fields.put("requeueCount", state.requeue_count);
        fields.put("scheduledTimes", state.scheduled_times);
        fields.put("scheduledRepeatCount", state.scheduled_repeat_count);
        fields.put("expired", u8::from(state.expired));
        fields.put("periodic", u8::from(state.periodic));
        fields.opt(
            "scheduledMessageParentId",
            state.scheduled_message_parent_id.as_deref(),
        );
        fields.opt(
            "requeuedMessageParentId",
            state.requeued_message_parent_id.as_deref(),
        );
        Ok(fields.0)
    }

    /// Decode hash fields. Missing mandatory fields are a contract violation.
    pub fn from_fields(fields: &HashMap<String, String>) -> QueueResult<Self> {
        let reader = FieldReader(fields);
        let id = reader.required("id")?.to_string();
        let destination = QueueParams::new(reader.required("queueNs")?, reader.required("queueName")?)?;
        let priority = match reader.opt::<u8>("priority")? {
            Some(value) => Some(MessagePriority::from_value(value).ok_or_else(|| {
                QueueError::ContractViolation(format!("message {} has priority {}", id, value))
            })?),
            None => None,
        };
        let payload = serde_json::from_str(reader.required("payload")?)
            .map_err(|e| QueueError::ContractViolation(format!("message {} payload: {}", id, e)))?;

        let state = MessageState {
            status: reader.required("status")?.parse::<MessageStatus>()?,
            published_at: reader.opt("publishedAt")?,
            scheduled_at: reader.opt("scheduledAt")?,
            last_scheduled_at: reader.opt("lastScheduledAt")?,
            processing_started_at: reader.opt("processingStartedAt")?,
            acknowledged_at: reader.opt("acknowledgedAt")?,
            unacknowledged_at: reader.opt("unacknowledgedAt")?,
            dead_lettered_at: reader.opt("deadLetteredAt")?,
            dead_lettered_reason: reader.opt("deadLetteredReason")?,
            requeued_at: reader.opt("requeuedAt")?,
            last_requeued_at: reader.opt("lastRequeuedAt")?,
            last_retried_attempt_at: reader.opt("lastRetriedAttemptAt")?,
            attempts: reader.or_default("attempts")?,
            requeue_count: reader.or_default("requeueCount")?,
            scheduled_times: reader.or_default("scheduledTimes")?,
            scheduled_repeat_count: reader.or_default("scheduledRepeatCount")?,
            expired: reader.or_default::<u8>("expired")? == 1,
            periodic: reader.or_default::<u8>("periodic")? == 1,
            scheduled_message_parent_id: reader.text("scheduledMessageParentId"),
            requeued_message_parent_id: reader.text("requeuedMessageParentId"),
        };

        Ok(Self {
            destination: Some(destination),
            consumer_group_id: reader.text("consumerGroupId"),
            priority,
            payload,
            ttl: reader.or_default("ttl")?,
            retry_threshold: reader
                .opt("retryThreshold")?
                .unwrap_or(DEFAULT_RETRY_THRESHOLD),
            retry_delay: reader.opt("retryDelay")?.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            consume_timeout: reader.or_default("consumeTimeout")?,
            schedule: MessageSchedule {
                delay: reader.or_default("delay")?,
                cron: reader.text("cron"),
                repeat: reader.or_default("repeat")?,
                repeat_period: reader.or_default("repeatPeriod")?,
            },
            exchange: reader.text("exchange"),
            routing_key: reader.text("routingKey"),
            created_at: reader.or_default("createdAt")?,
            id,
            state,
        })
    }
}

#[derive(Default)]
struct FieldWriter(Vec<(String, String)>);

impl FieldWriter {
    fn put(&mut self, name: &str, value: impl ToString) {
        self.0.push((name.to_string(), value.to_string()));
    }

    fn opt<T: ToString>(&mut self, name: &str, value: Option<T>) {
        if let Some(value) = value {
            self.put(name, value);
        }
    }
}

struct FieldReader<'a>(&'a HashMap<String, String>);

impl FieldReader<'_> {
    fn required(&self, name: &str) -> QueueResult<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| QueueError::ContractViolation(format!("message lacks field '{}'", name)))
    }

    fn text(&self, name: &str) -> Option<String> {
        self.0.get(name).filter(|v| !v.is_empty()).cloned()
    }

    fn opt<T: std::str::FromStr>(&self, name: &str) -> QueueResult<Option<T>> {
        match self.0.get(name).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                QueueError::ContractViolation(format!("field '{}' has value '{}'", name, raw))
            }),
        }
    }

    fn or_default<T: std::str::FromStr + Default>(&self, name: &str) -> QueueResult<T> {
        Ok(self.opt(name)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeadLetterReason;
    use serde_json::json;

    fn queue() -> QueueParams {
        QueueParams::new("ns", "orders").unwrap()
    }

    fn as_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn test_defaults() {
        let msg = MessageEnvelope::new(json!({"a": 1}));
        assert_eq!(msg.retry_threshold, 3);
        assert_eq!(msg.retry_delay, 60_000);
        assert_eq!(msg.state.status, MessageStatus::Pending);
        assert!(Uuid::parse_str(&msg.id).is_ok());
    }

    #[test]
    fn test_fields_round_trip() {
        let mut msg = MessageEnvelope::new(json!({"order": 7}))
            .to_queue(queue())
            .with_priority(MessagePriority::High)
            .with_ttl(Duration::from_secs(5))
            .with_cron("0 0 * * * *")
            .unwrap();
        msg.created_at = 1_000;
        msg.state.attempts = 2;
        msg.state.dead_lettered_reason = Some(DeadLetterReason::RetryThresholdExceeded);
        msg.state.periodic = true;

        let decoded = MessageEnvelope::from_fields(&as_map(msg.to_fields().unwrap())).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_missing_mandatory_field() {
        let msg = MessageEnvelope::new(json!(null)).to_queue(queue());
        let mut fields = as_map(msg.to_fields().unwrap());
        fields.remove("status");
        assert!(matches!(
            MessageEnvelope::from_fields(&fields),
            Err(QueueError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_to_fields_requires_destination() {
        let msg = MessageEnvelope::new(json!(null));
        assert!(matches!(
            msg.to_fields(),
            Err(QueueError::MessageDestinationRequired)
        ));
    }

    #[test]
    fn test_children_carry_lineage() {
        let parent = MessageEnvelope::new(json!("tick"))
            .to_queue(queue())
            .with_cron("0 * * * * *")
            .unwrap();
        let fired = parent.scheduled_child(5);
        assert_ne!(fired.id, parent.id);
        assert!(fired.state.periodic);
        assert_eq!(fired.state.scheduled_message_parent_id.as_deref(), Some(parent.id.as_str()));
        assert!(fired.schedule.cron.is_none());

        let requeued = fired.requeued_child(6);
        assert!(!requeued.state.periodic);
        assert_eq!(requeued.state.requeued_message_parent_id.as_deref(), Some(fired.id.as_str()));
    }

    #[test]
    fn test_priority_values() {
        assert_eq!(MessagePriority::Highest.value(), 0);
        assert_eq!(MessagePriority::from_value(7), Some(MessagePriority::Lowest));
        assert_eq!(MessagePriority::from_value(8), None);
    }
}
