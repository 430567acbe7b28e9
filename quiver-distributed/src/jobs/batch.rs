//! Cooperative batch runner.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::job::{BackgroundJob, JobStatus};
use super::manager::BackgroundJobManager;
use crate::error::{JobError, JobResult};

/// Outcome of one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchStep {
    /// More work remains; carries the progress so far.
    Continue(serde_json::Value),
    /// Work is finished; carries the final progress.
    Done(serde_json::Value),
}

/// Work split into batches.
///
/// Cancellation is checked before every batch, never in the middle of one.
#[async_trait]
pub trait BatchJob: Send {
    /// Run the next batch.
    async fn next_batch(&mut self, job: &BackgroundJob) -> JobResult<BatchStep>;

    /// Pause between batches.
    fn batch_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Runs jobs of one kind.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Job kind handled by this runner.
    fn kind(&self) -> &str;

    /// Run a job that was already started by the caller.
    async fn run(
        &self,
        manager: &BackgroundJobManager,
        job: BackgroundJob,
    ) -> JobResult<BackgroundJob>;
}

/// Drive a started job through its batches.
///
/// Completes the job when the last batch reports [`BatchStep::Done`], fails
/// it when a batch errors, and returns [`JobError::Cancelled`] without
/// completing when the job was canceled between batches.
pub async fn run_batch_job<B>(
    manager: &BackgroundJobManager,
    job_id: &str,
    batch: &mut B,
) -> JobResult<BackgroundJob>
where
    B: BatchJob + ?Sized,
{
    let mut batches = 0u64;
    loop {
        let job = manager.get(job_id).await?;
        match job.status {
            JobStatus::Processing => {}
            JobStatus::Canceled => {
                info!(job_id = %job_id, batches, "background job canceled, stopping");
                return Err(JobError::Cancelled(job_id.to_string()));
            }
            other => {
                return Err(JobError::InvalidTransition {
                    id: job_id.to_string(),
                    from: other.to_string(),
                    to: JobStatus::Processing.to_string(),
                });
            }
        }

        let step = match batch.next_batch(&job).await {
            Ok(step) => step,
            Err(e) => {
                if let Err(fail) = manager.fail(job_id, &e.to_string()).await {
                    warn!(job_id = %job_id, error = %fail, "could not mark job failed");
                }
                return Err(e);
            }
        };
        batches += 1;

        match step {
            BatchStep::Done(progress) => {
                return match manager.complete(job_id, progress).await {
                    // canceled while the last batch ran
                    Err(JobError::InvalidTransition { .. }) => {
                        Err(JobError::Cancelled(job_id.to_string()))
                    }
                    other => other,
                };
            }
            BatchStep::Continue(progress) => {
                manager.update_progress(job_id, progress).await?;
                if let Err(e) = manager.extend_lock(job_id).await {
                    warn!(job_id = %job_id, error = %e, "failed to extend target lock");
                }
                debug!(job_id = %job_id, batches, "batch done");
                let delay = batch.batch_delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
