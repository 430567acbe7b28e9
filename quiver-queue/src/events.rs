//! Broker events.
//!
//! Components report what happened to messages, consumers, workers and jobs
//! on one broadcast channel. Sending never blocks and never fails when
//! nobody listens; slow subscribers observe `Lagged` from the receiver.

use quiver_distributed::JobStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::message::{DeadLetterReason, UnackAction, UnackReason};
use crate::queue::QueueParams;

/// Something that happened inside the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A message was stored.
    MessagePublished {
        queue: QueueParams,
        message_id: String,
        consumer_group: Option<String>,
    },
    /// A consumer took a message.
    MessageReceived {
        queue: QueueParams,
        message_id: String,
        consumer_id: String,
    },
    /// A message was acknowledged.
    MessageAcknowledged {
        queue: QueueParams,
        message_id: String,
        consumer_id: String,
    },
    /// A message was handed back.
    MessageUnacknowledged {
        queue: QueueParams,
        message_id: String,
        reason: UnackReason,
        action: UnackAction,
    },
    /// A message reached its terminal failure state.
    MessageDeadLettered {
        queue: QueueParams,
        message_id: String,
        reason: DeadLetterReason,
    },
    /// A message waits in the delayed set for a retry.
    MessageDelayed {
        queue: QueueParams,
        message_id: String,
    },
    /// A message waits in the requeued list, or a finished message was
    /// requeued by id under a new id.
    MessageRequeued {
        queue: QueueParams,
        message_id: String,
        parent_id: Option<String>,
    },
    /// A consumer started.
    ConsumerUp { consumer_id: String },
    /// A consumer stopped, or the reaper found it offline.
    ConsumerDown { consumer_id: String },
    /// A worker tick failed.
    WorkerError {
        worker: String,
        error: String,
        fatal: bool,
    },
    /// A background job changed status.
    JobStatusChanged {
        job_id: String,
        kind: String,
        status: JobStatus,
    },
}

impl BrokerEvent {
    /// Events describing one unacknowledgment outcome.
    pub(crate) fn for_unack(
        queue: &QueueParams,
        message_id: &str,
        reason: UnackReason,
        action: UnackAction,
    ) -> Vec<BrokerEvent> {
        let mut events = vec![BrokerEvent::MessageUnacknowledged {
            queue: queue.clone(),
            message_id: message_id.to_string(),
            reason,
            action,
        }];
        match action {
            UnackAction::DeadLetter(reason) => events.push(BrokerEvent::MessageDeadLettered {
                queue: queue.clone(),
                message_id: message_id.to_string(),
                reason,
            }),
            UnackAction::Delay => events.push(BrokerEvent::MessageDelayed {
                queue: queue.clone(),
                message_id: message_id.to_string(),
            }),
            UnackAction::Requeue => events.push(BrokerEvent::MessageRequeued {
                queue: queue.clone(),
                message_id: message_id.to_string(),
                parent_id: None,
            }),
            UnackAction::Skipped => events.clear(),
        }
        events
    }
}

/// Broadcast channel for [`BrokerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn emit(&self, event: BrokerEvent) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
