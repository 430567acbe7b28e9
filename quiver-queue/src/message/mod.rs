//! Messages: envelope, state and schedule.

mod envelope;
mod schedule;
mod state;

pub use envelope::{DEFAULT_RETRY_DELAY_MS, DEFAULT_RETRY_THRESHOLD, MessageEnvelope, MessagePriority};
pub use schedule::{CronSchedule, MessageSchedule};
pub use state::{DeadLetterReason, MessageState, MessageStatus, UnackAction, UnackReason};
