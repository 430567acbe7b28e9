//! Error types for broker operations.

use quiver_distributed::{JobError, LockError};
use quiver_redis::{InvalidKeyName, StoreError};
use thiserror::Error;

/// Result type for broker operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Coarse classification of a [`QueueError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A queue, message, consumer group, exchange or job does not exist.
    NotFound,
    /// The entity already exists.
    Conflict,
    /// The operation is not allowed in the current state.
    Precondition,
    /// An optimistic transaction kept losing; the caller may retry.
    Concurrency,
    /// A job was canceled mid-run.
    Cancellation,
    /// A script replied with a shape the caller does not understand.
    ContractViolation,
    /// Connectivity or timeout failure.
    Transient,
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Queue already exists
    #[error("Queue already exists: {0}")]
    QueueAlreadyExists(String),

    /// Queue still holds messages
    #[error("Queue is not empty: {0}")]
    QueueNotEmpty(String),

    /// Queue has consumers with in-flight messages
    #[error("Queue has active consumers: {0}")]
    QueueHasActiveConsumers(String),

    /// Queue is bound to an exchange
    #[error("Queue is bound to an exchange: {0}")]
    QueueHasBindings(String),

    /// Queue is paused
    #[error("Queue is paused: {0}")]
    QueuePaused(String),

    /// Queue is stopped
    #[error("Queue is stopped: {0}")]
    QueueStopped(String),

    /// Queue is locked
    #[error("Queue is locked: {0}")]
    QueueLocked(String),

    /// Stored queue type is not recognised
    #[error("Unknown queue type")]
    UnknownQueueType,

    /// Message not found
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Message id already used
    #[error("Message already exists: {0}")]
    MessageAlreadyExists(String),

    /// Message is held by a consumer
    #[error("Message is in process: {0}")]
    MessageInProcess(String),

    /// Message is not in the given processing list
    #[error("Message is not being processed: {0}")]
    MessageNotProcessing(String),

    /// Only acknowledged or dead-lettered messages can be requeued
    #[error("Message is not requeuable: {0}")]
    MessageNotRequeuable(String),

    /// Priority queue without a priority
    #[error("A priority is required for priority queues")]
    MessagePriorityRequired,

    /// Priority given for a non-priority queue
    #[error("Priority queuing is not enabled for this queue")]
    PriorityQueuingNotEnabled,

    /// Message has no destination
    #[error("Message has no destination queue or exchange")]
    MessageDestinationRequired,

    /// Consumer group not found
    #[error("Consumer group not found: {0}")]
    ConsumerGroupNotFound(String),

    /// Consumer group already exists
    #[error("Consumer group already exists: {0}")]
    ConsumerGroupAlreadyExists(String),

    /// Consumer group still holds messages
    #[error("Consumer group is not empty: {0}")]
    ConsumerGroupNotEmpty(String),

    /// Point-to-point queues have no consumer groups
    #[error("Consumer groups are not supported by this queue")]
    ConsumerGroupsNotSupported,

    /// Pub-sub queue without any consumer group
    #[error("Queue has no consumer groups: {0}")]
    ConsumerGroupsRequired(String),

    /// Exchange not found
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Exchange name reused with another exchange type
    #[error("Exchange {0} exists with another type")]
    ExchangeTypeMismatch(String),

    /// Queue type differs from queues already bound to the exchange
    #[error("Queue type does not match the queues bound to exchange {0}")]
    ExchangeQueueTypeMismatch(String),

    /// Exchange still has bound queues
    #[error("Exchange has bound queues: {0}")]
    ExchangeHasBoundQueues(String),

    /// Routing key or binding pattern is malformed
    #[error("Invalid routing key: {0}")]
    InvalidRoutingKey(String),

    /// No queue matched the routing key
    #[error("No queues matched routing key '{0}'")]
    NoMatchedQueues(String),

    /// Invalid queue, namespace, group or exchange name
    #[error(transparent)]
    InvalidName(#[from] InvalidKeyName),

    /// Invalid cron expression
    #[error("Invalid cron expression: {0}")]
    InvalidCronExpression(String),

    /// Optimistic transaction retries exhausted
    #[error("Concurrent modification, retries exhausted: {0}")]
    Concurrency(String),

    /// A message handler returned an error
    #[error("Message handler failed: {0}")]
    HandlerFailed(String),

    /// Background job canceled
    #[error("Background job canceled: {0}")]
    Cancelled(String),

    /// A script replied with an unknown token or shape
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Consumer or worker lifecycle error
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Store error
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Lock error
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Background job error
    #[error("Background job error: {0}")]
    Job(JobError),
}

impl QueueError {
    /// Map a script error token to an error.
    ///
    /// Unknown tokens are contract violations.
    pub fn from_token(token: &str, subject: &str) -> Self {
        let subject = subject.to_string();
        match token {
            "QUEUE_NOT_FOUND" => Self::QueueNotFound(subject),
            "QUEUE_EXISTS" => Self::QueueAlreadyExists(subject),
            "QUEUE_NOT_EMPTY" => Self::QueueNotEmpty(subject),
            "QUEUE_HAS_ACTIVE_CONSUMERS" => Self::QueueHasActiveConsumers(subject),
            "QUEUE_HAS_BINDINGS" => Self::QueueHasBindings(subject),
            "QUEUE_PAUSED" => Self::QueuePaused(subject),
            "QUEUE_STOPPED" => Self::QueueStopped(subject),
            "QUEUE_LOCKED" => Self::QueueLocked(subject),
            "UNKNOWN_QUEUE_TYPE" => Self::UnknownQueueType,
            "MESSAGE_NOT_FOUND" => Self::MessageNotFound(subject),
            "MESSAGE_EXISTS" => Self::MessageAlreadyExists(subject),
            "MESSAGE_IN_PROCESS" => Self::MessageInProcess(subject),
            "MESSAGE_NOT_PROCESSING" => Self::MessageNotProcessing(subject),
            "MESSAGE_NOT_REQUEUABLE" => Self::MessageNotRequeuable(subject),
            "MESSAGE_PRIORITY_REQUIRED" => Self::MessagePriorityRequired,
            "PRIORITY_QUEUING_NOT_ENABLED" => Self::PriorityQueuingNotEnabled,
            "CONSUMER_GROUP_NOT_FOUND" => Self::ConsumerGroupNotFound(subject),
            "CONSUMER_GROUP_EXISTS" => Self::ConsumerGroupAlreadyExists(subject),
            "CONSUMER_GROUP_NOT_EMPTY" => Self::ConsumerGroupNotEmpty(subject),
            "CONSUMER_GROUPS_NOT_SUPPORTED" => Self::ConsumerGroupsNotSupported,
            "CONSUMER_GROUP_REQUIRED" => Self::ConsumerGroupsRequired(subject),
            other => Self::ContractViolation(format!("unknown reply token '{}'", other)),
        }
    }

    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::QueueNotFound(_)
            | Self::MessageNotFound(_)
            | Self::ConsumerGroupNotFound(_)
            | Self::ExchangeNotFound(_) => ErrorCategory::NotFound,
            Self::QueueAlreadyExists(_)
            | Self::MessageAlreadyExists(_)
            | Self::ConsumerGroupAlreadyExists(_) => ErrorCategory::Conflict,
            Self::Concurrency(_) => ErrorCategory::Concurrency,
            Self::Cancelled(_) => ErrorCategory::Cancellation,
            Self::ContractViolation(_) => ErrorCategory::ContractViolation,
            Self::Store(e) if e.is_contract_violation() => ErrorCategory::ContractViolation,
            Self::Store(_) | Self::Lock(LockError::Timeout) | Self::Lock(LockError::Store(_)) => {
                ErrorCategory::Transient
            }
            Self::Job(JobError::NotFound(_)) => ErrorCategory::NotFound,
            Self::Job(JobError::Conflict(_)) => ErrorCategory::Concurrency,
            Self::Job(e) if e.is_fatal() => ErrorCategory::ContractViolation,
            Self::Job(JobError::Store(_)) => ErrorCategory::Transient,
            _ => ErrorCategory::Precondition,
        }
    }

    /// Contract violations are unrecoverable; the owning worker shuts down.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::ContractViolation
    }
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ContractViolation(msg) => Self::ContractViolation(msg),
            other => Self::Store(other),
        }
    }
}

impl From<JobError> for QueueError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Cancelled(id) => Self::Cancelled(id),
            JobError::Store(StoreError::ContractViolation(msg)) => Self::ContractViolation(msg),
            other => Self::Job(other),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Cancelled(id) => JobError::Cancelled(id),
            QueueError::Job(e) => e,
            QueueError::Store(e) => JobError::Store(e),
            QueueError::ContractViolation(msg) => JobError::Store(StoreError::ContractViolation(msg)),
            other => JobError::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_mapping() {
        assert!(matches!(
            QueueError::from_token("QUEUE_NOT_FOUND", "q@ns"),
            QueueError::QueueNotFound(q) if q == "q@ns"
        ));
        assert!(matches!(
            QueueError::from_token("MESSAGE_NOT_REQUEUABLE", "m1"),
            QueueError::MessageNotRequeuable(_)
        ));
        let unknown = QueueError::from_token("WAT", "x");
        assert!(unknown.is_fatal());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            QueueError::QueueNotFound("q".into()).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            QueueError::MessageAlreadyExists("m".into()).category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            QueueError::MessagePriorityRequired.category(),
            ErrorCategory::Precondition
        );
        assert_eq!(
            QueueError::Concurrency("x".into()).category(),
            ErrorCategory::Concurrency
        );
        assert_eq!(
            QueueError::from(JobError::Cancelled("j".into())).category(),
            ErrorCategory::Cancellation
        );
        assert_eq!(
            QueueError::from(StoreError::Timeout).category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_contract_violation_is_fatal() {
        let err = QueueError::from(StoreError::contract("array expected"));
        assert!(matches!(err, QueueError::ContractViolation(_)));
        assert!(err.is_fatal());
        assert!(!QueueError::QueueLocked("q".into()).is_fatal());
    }

    #[test]
    fn test_round_trip_through_job_error() {
        let job: JobError = QueueError::Cancelled("j1".into()).into();
        assert!(matches!(job, JobError::Cancelled(_)));
        let back: QueueError = JobError::Store(StoreError::contract("bad")).into();
        assert!(back.is_fatal());
    }
}
