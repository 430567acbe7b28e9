//! Message status, reasons and the mutable state record.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::queue::string_enum;

/// Where a message is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Waiting for a consumer.
    Pending,
    /// Waiting for its delivery time.
    Scheduled,
    /// Held by a consumer.
    Processing,
    /// Finished successfully.
    Acknowledged,
    /// Failed; waiting in the delayed set for a retry.
    UnackDelaying,
    /// Failed; waiting in the requeued list for a retry.
    UnackRequeuing,
    /// Failed for good.
    DeadLettered,
}

string_enum!(MessageStatus {
    Pending => "PENDING",
    Scheduled => "SCHEDULED",
    Processing => "PROCESSING",
    Acknowledged => "ACKNOWLEDGED",
    UnackDelaying => "UNACK_DELAYING",
    UnackRequeuing => "UNACK_REQUEUING",
    DeadLettered => "DEAD_LETTERED",
});

impl MessageStatus {
    /// Whether the message can be requeued by id.
    pub fn is_requeuable(self) -> bool {
        matches!(self, MessageStatus::Acknowledged | MessageStatus::DeadLettered)
    }
}

/// Why a consumer gave a message back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnackReason {
    /// The message outlived its TTL before it was handled.
    TtlExpired,
    /// The consumer went away while holding the message.
    OfflineConsumer,
    /// No handler is registered for the queue anymore.
    OfflineMessageHandler,
    /// The handler returned an error or panicked.
    ConsumeError,
    /// The handler exceeded the consume timeout.
    Timeout,
}

string_enum!(UnackReason {
    TtlExpired => "TTL_EXPIRED",
    OfflineConsumer => "OFFLINE_CONSUMER",
    OfflineMessageHandler => "OFFLINE_MESSAGE_HANDLER",
    ConsumeError => "CONSUME_ERROR",
    Timeout => "TIMEOUT",
});

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    /// Expired.
    TtlExpired,
    /// Periodic messages are never retried.
    PeriodicMessage,
    /// Attempts reached the retry threshold.
    RetryThresholdExceeded,
}

string_enum!(DeadLetterReason {
    TtlExpired => "TTL_EXPIRED",
    PeriodicMessage => "PERIODIC_MESSAGE",
    RetryThresholdExceeded => "RETRY_THRESHOLD_EXCEEDED",
});

/// What unacknowledgment did to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnackAction {
    /// Moved to the dead-lettered store.
    DeadLetter(DeadLetterReason),
    /// Moved to the delayed set.
    Delay,
    /// Moved to the requeued list.
    Requeue,
    /// Not in the processing list anymore; nothing done.
    Skipped,
}

impl fmt::Display for UnackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnackAction::DeadLetter(reason) => write!(f, "DEAD_LETTER({})", reason),
            UnackAction::Delay => f.write_str("DELAY"),
            UnackAction::Requeue => f.write_str("REQUEUE"),
            UnackAction::Skipped => f.write_str("SKIPPED"),
        }
    }
}

/// Mutable part of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    /// Current status.
    pub status: MessageStatus,
    /// First entry into pending.
    pub published_at: Option<i64>,
    /// Entry into the scheduled set.
    pub scheduled_at: Option<i64>,
    /// Last firing of a scheduled message.
    pub last_scheduled_at: Option<i64>,
    /// Last hand-over to a consumer.
    pub processing_started_at: Option<i64>,
    /// Acknowledgement.
    pub acknowledged_at: Option<i64>,
    /// Last unacknowledgment.
    pub unacknowledged_at: Option<i64>,
    /// Dead-lettering.
    pub dead_lettered_at: Option<i64>,
    /// Why it was dead-lettered.
    pub dead_lettered_reason: Option<DeadLetterReason>,
    /// First requeue by id.
    pub requeued_at: Option<i64>,
    /// Last requeue by id.
    pub last_requeued_at: Option<i64>,
    /// Last return to pending after a failure.
    pub last_retried_attempt_at: Option<i64>,
    /// Failed deliveries that were retried.
    pub attempts: u32,
    /// Requeues by id.
    pub requeue_count: u32,
    /// Firings of a scheduled message.
    pub scheduled_times: u32,
    /// Position inside the current repeat burst.
    pub scheduled_repeat_count: u32,
    /// TTL elapsed before delivery.
    pub expired: bool,
    /// Created by a periodic schedule.
    pub periodic: bool,
    /// The scheduled message that fired this one.
    pub scheduled_message_parent_id: Option<String>,
    /// The message this one was requeued from.
    pub requeued_message_parent_id: Option<String>,
}

impl Default for MessageState {
    fn default() -> Self {
        Self {
            status: MessageStatus::Pending,
            published_at: None,
            scheduled_at: None,
            last_scheduled_at: None,
            processing_started_at: None,
            acknowledged_at: None,
            unacknowledged_at: None,
            dead_lettered_at: None,
            dead_lettered_reason: None,
            requeued_at: None,
            last_requeued_at: None,
            last_retried_attempt_at: None,
            attempts: 0,
            requeue_count: 0,
            scheduled_times: 0,
            scheduled_repeat_count: 0,
            expired: false,
            periodic: false,
            scheduled_message_parent_id: None,
            requeued_message_parent_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Scheduled,
            MessageStatus::Processing,
            MessageStatus::Acknowledged,
            MessageStatus::UnackDelaying,
            MessageStatus::UnackRequeuing,
            MessageStatus::DeadLettered,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_requeuable_statuses() {
        assert!(MessageStatus::Acknowledged.is_requeuable());
        assert!(MessageStatus::DeadLettered.is_requeuable());
        assert!(!MessageStatus::Processing.is_requeuable());
        assert!(!MessageStatus::UnackDelaying.is_requeuable());
    }

    #[test]
    fn test_unack_action_display() {
        assert_eq!(
            UnackAction::DeadLetter(DeadLetterReason::PeriodicMessage).to_string(),
            "DEAD_LETTER(PERIODIC_MESSAGE)"
        );
        assert_eq!(UnackReason::OfflineConsumer.to_string(), "OFFLINE_CONSUMER");
    }
}
