//! Background job worker.

use async_trait::async_trait;
use parking_lot::RwLock;
use quiver_distributed::{BackgroundJob, JobError, JobRunner, JobStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::Worker;
use crate::broker::BrokerContext;
use crate::error::QueueResult;
use crate::events::BrokerEvent;

/// Picks pending background jobs up and runs them, one per tick.
pub struct JobWorker {
    ctx: Arc<BrokerContext>,
    runners: RwLock<HashMap<String, Arc<dyn JobRunner>>>,
}

impl JobWorker {
    pub(crate) fn new(ctx: Arc<BrokerContext>) -> Self {
        Self {
            ctx,
            runners: RwLock::new(HashMap::new()),
        }
    }

    /// Register the runner for its job kind, replacing any previous one.
    pub fn register(&self, runner: Arc<dyn JobRunner>) {
        self.runners
            .write()
            .insert(runner.kind().to_string(), runner);
    }

    fn emit(&self, job: &BackgroundJob) {
        self.ctx.events.emit(BrokerEvent::JobStatusChanged {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            status: job.status,
        });
    }
}

#[async_trait]
impl Worker for JobWorker {
    fn name(&self) -> &str {
        "jobs"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.workers.tick_interval
    }

    async fn start(&self) -> QueueResult<()> {
        let recovered = self.ctx.jobs().recover_stuck_jobs().await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered stuck background jobs");
        }
        Ok(())
    }

    async fn tick(&self) -> QueueResult<usize> {
        let jobs = self.ctx.jobs();
        let Some(pending) = jobs.next_pending().await? else {
            return Ok(0);
        };

        let job = match jobs.start(&pending.id).await {
            Ok(job) => job,
            // canceled or taken since it was listed
            Err(JobError::InvalidTransition { .. }) => return Ok(0),
            Err(JobError::TargetLocked(target)) => {
                warn!(job_id = %pending.id, target = %target, "job target locked elsewhere");
                self.emit(&jobs.get(&pending.id).await?);
                return Ok(1);
            }
            Err(e) => return Err(e.into()),
        };
        self.emit(&job);

        let runner = self.runners.read().get(&job.kind).cloned();
        let Some(runner) = runner else {
            let error = JobError::UnknownKind(job.kind.clone()).to_string();
            let failed = jobs.fail(&job.id, &error).await?;
            self.emit(&failed);
            return Ok(1);
        };

        let id = job.id.clone();
        match runner.run(&jobs, job).await {
            Ok(_) => {}
            Err(JobError::Cancelled(_)) => info!(job_id = %id, "background job stopped after cancel"),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(job_id = %id, error = %e, "background job failed"),
        }

        let mut finished = jobs.get(&id).await?;
        if finished.status == JobStatus::Processing {
            // the runner gave up without settling the job
            finished = jobs.fail(&id, "runner stopped without finishing the job").await?;
        }
        self.emit(&finished);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use quiver_distributed::BackgroundJobManager;
    use quiver_redis::MemoryStore;

    struct Echo;

    #[async_trait]
    impl JobRunner for Echo {
        fn kind(&self) -> &str {
            "echo"
        }

        async fn run(
            &self,
            manager: &BackgroundJobManager,
            job: BackgroundJob,
        ) -> quiver_distributed::JobResult<BackgroundJob> {
            manager.complete(&job.id, job.payload.clone()).await
        }
    }

    fn broker() -> Broker {
        Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_runs_registered_kind() {
        let broker = broker();
        let worker = JobWorker::new(Arc::clone(broker.context()));
        worker.register(Arc::new(Echo));

        let job = broker
            .jobs()
            .create("echo", "t1", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let mut events = broker.subscribe();
        assert_eq!(worker.tick().await.unwrap(), 1);
        assert_eq!(worker.tick().await.unwrap(), 0);

        let done = broker.jobs().get(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, serde_json::json!({"n": 1}));

        let statuses: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                BrokerEvent::JobStatusChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![JobStatus::Processing, JobStatus::Completed]);
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_the_job() {
        let broker = broker();
        let worker = JobWorker::new(Arc::clone(broker.context()));
        let job = broker
            .jobs()
            .create("mystery", "t1", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(worker.tick().await.unwrap(), 1);

        let failed = broker.jobs().get(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("mystery"));
        assert!(!broker.jobs().target_lock("t1").is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_start_recovers_stuck_jobs() {
        let broker = broker();
        let jobs = broker.jobs();
        let job = jobs.create("echo", "t1", serde_json::json!({})).await.unwrap();
        jobs.start(&job.id).await.unwrap();

        let worker = JobWorker::new(Arc::clone(broker.context()));
        worker.register(Arc::new(Echo));
        worker.start().await.unwrap();
        assert_eq!(jobs.get(&job.id).await.unwrap().status, JobStatus::Pending);

        worker.tick().await.unwrap();
        assert_eq!(jobs.get(&job.id).await.unwrap().status, JobStatus::Completed);
    }
}
