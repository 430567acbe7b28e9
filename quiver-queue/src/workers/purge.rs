//! Queue purge job.
//!
//! Deletes a queue's messages page by page through the delete script.
//! Messages that are being processed are never deleted; the job steps over
//! them, so it always finishes even while consumers keep working.

use async_trait::async_trait;
use quiver_distributed::{
    BackgroundJob, BackgroundJobManager, BatchJob, BatchStep, JobResult, JobRunner, run_batch_job,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::BrokerContext;
use crate::error::QueueResult;
use crate::message_manager::{MessageListing, MessageManager, Storage};
use crate::queue::{QueueParams, QueueRegistry};
use crate::scripts::{DeleteOutcome, DeleteTarget};

/// Job kind of queue purges.
pub const PURGE_QUEUE_KIND: &str = "purge-queue";

/// Which messages a purge removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeScope {
    /// Every message that is not being processed.
    #[default]
    All,
    /// Pending messages.
    Pending,
    /// Messages waiting for their delivery time.
    Scheduled,
    /// The acknowledged audit store.
    Acknowledged,
    /// The dead-lettered audit store.
    DeadLettered,
}

/// Payload of a purge job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgePayload {
    /// Queue to purge.
    pub queue: QueueParams,
    /// Messages to remove.
    pub scope: PurgeScope,
    /// Messages per batch.
    pub batch_size: u64,
    /// Pause between batches in milliseconds.
    pub batch_delay_ms: u64,
}

/// Progress of a purge job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeProgress {
    /// Messages deleted so far.
    pub total_purged: u64,
    /// Batches that deleted or skipped anything.
    pub batches: u64,
}

struct Source {
    storage: Storage,
    group: Option<String>,
}

/// Batch state of one purge run.
struct PurgeQueueJob {
    ctx: Arc<BrokerContext>,
    payload: PurgePayload,
    sources: Option<Vec<Source>>,
    current: usize,
    offset: u64,
    progress: PurgeProgress,
}

impl PurgeQueueJob {
    fn new(ctx: Arc<BrokerContext>, payload: PurgePayload) -> Self {
        Self {
            ctx,
            payload,
            sources: None,
            current: 0,
            offset: 0,
            progress: PurgeProgress::default(),
        }
    }

    async fn resolve_sources(&self) -> QueueResult<Vec<Source>> {
        let queue = &self.payload.queue;
        let messages = MessageManager::new(Arc::clone(&self.ctx));
        let targets = QueueRegistry::new(Arc::clone(&self.ctx)).targets(queue).await?;

        let mut listings = Vec::new();
        let per_target = |listing: fn(Option<String>) -> MessageListing| {
            targets
                .iter()
                .map(move |group| (listing(group.clone()), group.clone()))
        };
        match self.payload.scope {
            PurgeScope::All => {
                listings.extend(per_target(|group| MessageListing::Pending { group }));
                listings.extend(per_target(|group| MessageListing::Delayed { group }));
                listings.extend(per_target(|group| MessageListing::Requeued { group }));
                listings.push((MessageListing::Scheduled, None));
                listings.push((MessageListing::Acknowledged, None));
                listings.push((MessageListing::DeadLettered, None));
            }
            PurgeScope::Pending => {
                listings.extend(per_target(|group| MessageListing::Pending { group }));
            }
            PurgeScope::Scheduled => listings.push((MessageListing::Scheduled, None)),
            PurgeScope::Acknowledged => listings.push((MessageListing::Acknowledged, None)),
            PurgeScope::DeadLettered => listings.push((MessageListing::DeadLettered, None)),
        }

        let mut sources = Vec::with_capacity(listings.len());
        for (listing, group) in listings {
            sources.push(Source {
                storage: messages.storage(queue, &listing).await?,
                group,
            });
        }
        Ok(sources)
    }

    fn advance(&mut self) {
        self.current += 1;
        self.offset = 0;
    }

    /// Skip empty sources; `false` once none is left.
    async fn has_more(&mut self, sources: &[Source]) -> QueueResult<bool> {
        while let Some(source) = sources.get(self.current) {
            if source.storage.len(self.ctx.store.as_ref()).await? > 0 {
                return Ok(true);
            }
            self.advance();
        }
        Ok(false)
    }

    async fn step(&mut self, sources: &[Source]) -> QueueResult<BatchStep> {
        let batch = self.payload.batch_size.max(1);
        let (ids, group) = loop {
            let Some(source) = sources.get(self.current) else {
                return Ok(BatchStep::Done(serde_json::to_value(self.progress)?));
            };
            let ids = source
                .storage
                .page(self.ctx.store.as_ref(), self.offset, batch)
                .await?;
            if ids.is_empty() {
                self.advance();
                continue;
            }
            break (ids, source.group.clone());
        };

        let targets: Vec<DeleteTarget> = ids
            .iter()
            .map(|id| DeleteTarget {
                id: id.clone(),
                queue: self.payload.queue.clone(),
                group: group.clone(),
            })
            .collect();
        let outcome = MessageManager::new(Arc::clone(&self.ctx))
            .delete_many(&targets)
            .await?;
        let deleted = outcome
            .iter()
            .filter(|(_, o)| *o == DeleteOutcome::Deleted)
            .count() as u64;

        self.progress.total_purged += deleted;
        self.progress.batches += 1;
        self.offset += ids.len() as u64 - deleted;
        debug!(
            queue = %self.payload.queue,
            deleted,
            skipped = ids.len() as u64 - deleted,
            "purge batch"
        );

        if (ids.len() as u64) < batch {
            self.advance();
            if !self.has_more(sources).await? {
                return Ok(BatchStep::Done(serde_json::to_value(self.progress)?));
            }
        }
        Ok(BatchStep::Continue(serde_json::to_value(self.progress)?))
    }
}

#[async_trait]
impl BatchJob for PurgeQueueJob {
    async fn next_batch(&mut self, _job: &BackgroundJob) -> JobResult<BatchStep> {
        let sources = match self.sources.take() {
            Some(sources) => sources,
            None => self.resolve_sources().await?,
        };
        let step = self.step(&sources).await;
        self.sources = Some(sources);
        Ok(step?)
    }

    fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.payload.batch_delay_ms)
    }
}

/// Runs purge jobs.
pub struct PurgeRunner {
    ctx: Arc<BrokerContext>,
}

impl PurgeRunner {
    pub(crate) fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobRunner for PurgeRunner {
    fn kind(&self) -> &str {
        PURGE_QUEUE_KIND
    }

    async fn run(
        &self,
        manager: &BackgroundJobManager,
        job: BackgroundJob,
    ) -> JobResult<BackgroundJob> {
        let payload: PurgePayload = job.payload_as()?;
        info!(job_id = %job.id, queue = %payload.queue, scope = ?payload.scope, "purging queue");
        let mut purge = PurgeQueueJob::new(Arc::clone(&self.ctx), payload);
        run_batch_job(manager, &job.id, &mut purge).await
    }
}
