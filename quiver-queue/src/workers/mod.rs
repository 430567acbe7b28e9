//! Maintenance workers.
//!
//! Delayed and scheduled messages only become pending when a worker
//! promotes them, consumers that died mid-message are reaped, and
//! background jobs such as queue purges run here. One [`WorkerCluster`]
//! member per deployment is active at a time.

mod cluster;
mod delay;
mod job;
mod purge;
mod reaper;
mod requeue;
mod schedule;

pub use cluster::WorkerCluster;
pub use job::JobWorker;
pub use purge::{PURGE_QUEUE_KIND, PurgePayload, PurgeProgress, PurgeRunner, PurgeScope};

pub(crate) use delay::DelayWorker;
pub(crate) use reaper::ConsumerReaper;
pub(crate) use requeue::RequeueWorker;
pub(crate) use schedule::ScheduleWorker;

use async_trait::async_trait;
use std::time::Duration;

use crate::broker::BrokerContext;
use crate::error::{QueueError, QueueResult};
use crate::queue::{QueueParams, QueueRegistry};

/// A periodic maintenance task.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name used in logs and events.
    fn name(&self) -> &str;

    /// Pause between ticks.
    fn interval(&self) -> Duration;

    /// Prepare before the first tick.
    async fn start(&self) -> QueueResult<()> {
        Ok(())
    }

    /// Do one round of work and return how many items it handled.
    async fn tick(&self) -> QueueResult<usize>;
}

/// Every queue with its pending targets.
///
/// Queues deleted while the list is read are left out.
pub(crate) async fn queue_targets(
    ctx: &std::sync::Arc<BrokerContext>,
) -> QueueResult<Vec<(QueueParams, Vec<Option<String>>)>> {
    let registry = QueueRegistry::new(std::sync::Arc::clone(ctx));
    let mut all = Vec::new();
    for queue in registry.list().await? {
        match registry.targets(&queue).await {
            Ok(targets) => all.push((queue, targets)),
            Err(QueueError::QueueNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(all)
}
