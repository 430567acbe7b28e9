//! Background jobs.
//!
//! A background job is a tracked unit of maintenance work on a target
//! resource (a queue, for example). Jobs move through
//! `PENDING -> PROCESSING -> {COMPLETED, FAILED, CANCELED}`, hold a lock on
//! their target while active, and run in cancellable batches.

mod batch;
mod job;
mod manager;

pub use batch::{BatchJob, BatchStep, JobRunner, run_batch_job};
pub use job::{BackgroundJob, JobStatus};
pub use manager::BackgroundJobManager;
