//! Background job manager.

use quiver_redis::{GLOBAL_NAMESPACE, KeyScheme, KeyType, Store, TxOp};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::job::{BackgroundJob, JobStatus};
use crate::error::{JobError, JobResult, LockError};
use crate::lock::DistributedLock;

/// Optimistic retries for a single job update.
const MAX_UPDATE_ATTEMPTS: usize = 16;

/// Creates, tracks and transitions background jobs.
///
/// Creating a job locks its target with the job id as token, so at most one
/// active job exists per target across the cluster. The lock is released
/// whenever the job reaches a terminal status.
#[derive(Clone)]
pub struct BackgroundJobManager {
    store: Arc<dyn Store>,
    scheme: KeyScheme,
    lock_ttl: Duration,
    jobs_key: String,
}

impl BackgroundJobManager {
    /// Create a manager.
    pub fn new(store: Arc<dyn Store>, scheme: KeyScheme, lock_ttl: Duration) -> Self {
        let jobs_key = scheme.global(KeyType::BackgroundJobs, "jobs");
        Self {
            store,
            scheme,
            lock_ttl,
            jobs_key,
        }
    }

    /// Lock guarding a target.
    pub fn target_lock(&self, target: &str) -> DistributedLock {
        let key = self
            .scheme
            .key(GLOBAL_NAMESPACE, KeyType::Locks, "background-job", &[target]);
        DistributedLock::new(Arc::clone(&self.store), key, self.lock_ttl)
    }

    fn target_key(&self, target: &str) -> String {
        self.scheme
            .key(GLOBAL_NAMESPACE, KeyType::BackgroundJobs, "targets", &[target])
    }

    /// Create a job, locking its target.
    pub async fn create(
        &self,
        kind: &str,
        target: &str,
        payload: serde_json::Value,
    ) -> JobResult<BackgroundJob> {
        let mut job = BackgroundJob::new(kind, target, payload);
        let lock = self.target_lock(target);
        match lock.acquire_with_token(job.id.clone()).await {
            Ok(guard) => job.lock_id = Some(guard.token().to_string()),
            Err(LockError::AlreadyLocked(_)) => {
                return Err(JobError::TargetLocked(target.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.insert(&job).await {
            if let Err(release) = lock.release(&job.id).await {
                warn!(job_id = %job.id, error = %release, "failed to release target lock");
            }
            return Err(e);
        }

        info!(job_id = %job.id, kind = %kind, target = %target, "background job created");
        Ok(job)
    }

    async fn insert(&self, job: &BackgroundJob) -> JobResult<()> {
        let session = self.store.watch(&[]).await?;
        let ops = vec![
            TxOp::HSet {
                key: self.jobs_key.clone(),
                field: job.id.clone(),
                value: serde_json::to_string(job)?,
            },
            TxOp::SAdd {
                key: self.target_key(&job.target),
                member: job.id.clone(),
            },
        ];
        session.exec(ops).await?;
        Ok(())
    }

    /// Get a job.
    pub async fn get(&self, id: &str) -> JobResult<BackgroundJob> {
        let raw = self
            .store
            .hget(&self.jobs_key, id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> JobResult<Vec<BackgroundJob>> {
        let mut jobs = self
            .store
            .hgetall(&self.jobs_key)
            .await?
            .into_values()
            .map(|raw| serde_json::from_str::<BackgroundJob>(&raw))
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Jobs created for a target, oldest first.
    pub async fn list_by_target(&self, target: &str) -> JobResult<Vec<BackgroundJob>> {
        let mut jobs = Vec::new();
        for id in self.store.smembers(&self.target_key(target)).await? {
            match self.get(&id).await {
                Ok(job) => jobs.push(job),
                Err(JobError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Oldest pending job.
    pub async fn next_pending(&self) -> JobResult<Option<BackgroundJob>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|job| job.status == JobStatus::Pending))
    }

    /// Read-modify-write a job under optimistic concurrency.
    async fn update<F>(&self, id: &str, mut apply: F) -> JobResult<BackgroundJob>
    where
        F: FnMut(&mut BackgroundJob) -> JobResult<()> + Send,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut session = self.store.watch(std::slice::from_ref(&self.jobs_key)).await?;
            let Some(raw) = session.hget(&self.jobs_key, id).await? else {
                session.discard().await?;
                return Err(JobError::NotFound(id.to_string()));
            };
            let mut job: BackgroundJob = serde_json::from_str(&raw)?;
            if let Err(e) = apply(&mut job) {
                session.discard().await?;
                return Err(e);
            }
            job.updated_at = chrono::Utc::now();
            let ops = vec![TxOp::HSet {
                key: self.jobs_key.clone(),
                field: id.to_string(),
                value: serde_json::to_string(&job)?,
            }];
            if session.exec(ops).await? {
                return Ok(job);
            }
            debug!(job_id = %id, "job update conflict, retrying");
        }
        Err(JobError::Conflict(id.to_string()))
    }

    /// Pick a pending job up, re-claiming its target lock.
    pub async fn start(&self, id: &str) -> JobResult<BackgroundJob> {
        let job = self
            .update(id, |job| job.transition(JobStatus::Processing))
            .await?;
        let token = job.lock_id.clone().unwrap_or_else(|| job.id.clone());
        match self.target_lock(&job.target).claim(token).await {
            Ok(_) => {
                info!(job_id = %id, kind = %job.kind, "background job started");
                Ok(job)
            }
            Err(LockError::AlreadyLocked(_)) => {
                self.fail(id, "target locked by another holder").await?;
                Err(JobError::TargetLocked(job.target))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record progress of a running job.
    ///
    /// Fails with [`JobError::Cancelled`] once the job was canceled.
    pub async fn update_progress(
        &self,
        id: &str,
        progress: serde_json::Value,
    ) -> JobResult<BackgroundJob> {
        self.update(id, |job| match job.status {
            JobStatus::Processing => {
                job.progress = progress.clone();
                Ok(())
            }
            JobStatus::Canceled => Err(JobError::Cancelled(job.id.clone())),
            other => Err(JobError::InvalidTransition {
                id: job.id.clone(),
                from: other.to_string(),
                to: JobStatus::Processing.to_string(),
            }),
        })
        .await
    }

    /// Refresh the TTL of the job's target lock.
    pub async fn extend_lock(&self, id: &str) -> JobResult<()> {
        let job = self.get(id).await?;
        let token = job.lock_id.as_deref().unwrap_or(&job.id);
        self.target_lock(&job.target).extend(token).await?;
        Ok(())
    }

    /// Mark a running job completed.
    pub async fn complete(
        &self,
        id: &str,
        progress: serde_json::Value,
    ) -> JobResult<BackgroundJob> {
        let job = self
            .update(id, |job| {
                job.transition(JobStatus::Completed)?;
                job.progress = progress.clone();
                Ok(())
            })
            .await?;
        self.release_target(&job).await;
        info!(job_id = %id, "background job completed");
        Ok(job)
    }

    /// Mark a running job failed.
    pub async fn fail(&self, id: &str, error: &str) -> JobResult<BackgroundJob> {
        let job = self
            .update(id, |job| {
                job.transition(JobStatus::Failed)?;
                job.error = Some(error.to_string());
                Ok(())
            })
            .await?;
        self.release_target(&job).await;
        warn!(job_id = %id, error = %error, "background job failed");
        Ok(job)
    }

    /// Cancel a pending or running job.
    pub async fn cancel(&self, id: &str) -> JobResult<BackgroundJob> {
        let job = self
            .update(id, |job| job.transition(JobStatus::Canceled))
            .await?;
        self.release_target(&job).await;
        info!(job_id = %id, "background job canceled");
        Ok(job)
    }

    /// Lock release never fails the caller.
    async fn release_target(&self, job: &BackgroundJob) {
        let token = job.lock_id.as_deref().unwrap_or(&job.id);
        if let Err(e) = self.target_lock(&job.target).release(token).await {
            warn!(job_id = %job.id, target = %job.target, error = %e, "failed to release target lock");
        }
    }

    /// Return jobs left in PROCESSING by a crashed worker to PENDING.
    ///
    /// The target lock is re-claimed with the job's lock id first; a job
    /// whose lock now belongs to another holder is failed instead. Returns
    /// the ids of the recovered jobs.
    pub async fn recover_stuck_jobs(&self) -> JobResult<Vec<String>> {
        let mut recovered = Vec::new();
        for job in self.list().await? {
            if job.status != JobStatus::Processing {
                continue;
            }
            let token = job.lock_id.clone().unwrap_or_else(|| job.id.clone());
            match self.target_lock(&job.target).claim(token).await {
                Ok(_) => {
                    let reset = self
                        .update(&job.id, |j| {
                            if j.status == JobStatus::Processing {
                                j.status = JobStatus::Pending;
                                j.started_at = None;
                            }
                            Ok(())
                        })
                        .await?;
                    if reset.status == JobStatus::Pending {
                        info!(job_id = %job.id, "recovered stuck background job");
                        recovered.push(job.id);
                    }
                }
                Err(LockError::AlreadyLocked(_)) => {
                    self.fail(&job.id, "target lock lost during recovery").await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_redis::MemoryStore;
    use serde_json::json;

    fn manager() -> BackgroundJobManager {
        BackgroundJobManager::new(
            Arc::new(MemoryStore::new()),
            KeyScheme::default(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_one_active_job_per_target() {
        let manager = manager();
        let first = manager.create("purge-queue", "q@ns", json!({})).await.unwrap();
        let err = manager
            .create("purge-queue", "q@ns", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::TargetLocked(_)));

        // another target is unaffected
        manager.create("purge-queue", "r@ns", json!({})).await.unwrap();

        manager.cancel(&first.id).await.unwrap();
        manager.create("purge-queue", "q@ns", json!({})).await.unwrap();
        assert_eq!(manager.list_by_target("q@ns").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_releases_lock() {
        let manager = manager();
        let job = manager.create("purge-queue", "q@ns", json!({})).await.unwrap();
        let lock = manager.target_lock("q@ns");
        assert_eq!(lock.owner().await.unwrap().as_deref(), Some(job.id.as_str()));

        manager.start(&job.id).await.unwrap();
        manager
            .update_progress(&job.id, json!({"total_purged": 5}))
            .await
            .unwrap();
        let done = manager
            .complete(&job.id, json!({"total_purged": 10}))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress["total_purged"], 10);
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let manager = manager();
        let job = manager.create("k", "t", json!({})).await.unwrap();
        assert!(matches!(
            manager.complete(&job.id, json!({})).await,
            Err(JobError::InvalidTransition { .. })
        ));
        manager.cancel(&job.id).await.unwrap();
        assert!(matches!(
            manager.start(&job.id).await,
            Err(JobError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.get("missing").await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_progress_after_cancel_reports_cancelled() {
        let manager = manager();
        let job = manager.create("k", "t", json!({})).await.unwrap();
        manager.start(&job.id).await.unwrap();
        manager.cancel(&job.id).await.unwrap();
        assert!(matches!(
            manager.update_progress(&job.id, json!({})).await,
            Err(JobError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_stuck_jobs() {
        let manager = manager();
        let stuck = manager.create("k", "a", json!({})).await.unwrap();
        manager.start(&stuck.id).await.unwrap();

        let stolen = manager.create("k", "b", json!({})).await.unwrap();
        manager.start(&stolen.id).await.unwrap();
        // the target lock of the second job now belongs to someone else
        let lock = manager.target_lock("b");
        lock.release(&stolen.id).await.unwrap();
        lock.acquire_with_token("other").await.unwrap();

        let recovered = manager.recover_stuck_jobs().await.unwrap();
        assert_eq!(recovered, vec![stuck.id.clone()]);
        assert_eq!(
            manager.get(&stuck.id).await.unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(
            manager.get(&stolen.id).await.unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(
            manager.next_pending().await.unwrap().map(|j| j.id),
            Some(stuck.id)
        );
    }
}
