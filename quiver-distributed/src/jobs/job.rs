//! Background job record and status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{JobError, JobResult};

/// Background job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker
    Pending,
    /// Being run by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Canceled by a caller
    Canceled,
}

impl JobStatus {
    /// Check if moving to `next` is allowed.
    ///
    /// `PENDING -> PROCESSING -> {COMPLETED, FAILED, CANCELED}` and
    /// `PENDING -> CANCELED`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Canceled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Canceled)
        )
    }

    /// Check if the status is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked, lockable unit of maintenance work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    /// Unique job identifier
    pub id: String,

    /// Job kind, used to pick a runner
    pub kind: String,

    /// Identity of the resource the job operates on
    pub target: String,

    /// Current status
    pub status: JobStatus,

    /// Runner input
    pub payload: serde_json::Value,

    /// Runner-defined progress counters
    pub progress: serde_json::Value,

    /// Token of the target lock held on behalf of the job
    pub lock_id: Option<String>,

    /// Error message (if failed)
    pub error: Option<String>,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// Last update
    pub updated_at: DateTime<Utc>,

    /// When a worker picked the job up
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackgroundJob {
    /// Create a new pending job.
    pub fn new(
        kind: impl Into<String>,
        target: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            target: target.into(),
            status: JobStatus::Pending,
            payload,
            progress: serde_json::Value::Null,
            lock_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: JobStatus) -> JobResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next == JobStatus::Processing {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Decode the payload.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> JobResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
