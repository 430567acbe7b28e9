//! Requeued to pending promotion.

use async_trait::async_trait;
use quiver_redis::StoreExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Worker, queue_targets};
use crate::broker::BrokerContext;
use crate::error::QueueResult;
use crate::scripts::PromoteRequeued;

/// Moves messages handed back without a retry delay to pending.
pub(crate) struct RequeueWorker {
    ctx: Arc<BrokerContext>,
}

impl RequeueWorker {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Worker for RequeueWorker {
    fn name(&self) -> &str {
        "requeue"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.workers.tick_interval
    }

    async fn tick(&self) -> QueueResult<usize> {
        let now = self.ctx.now();
        let mut promoted = 0;
        for (queue, targets) in queue_targets(&self.ctx).await? {
            for group in targets {
                let moved = self
                    .ctx
                    .store
                    .call(&PromoteRequeued {
                        keys: &self.ctx.keys,
                        queue: &queue,
                        group: group.as_deref(),
                        batch: self.ctx.config.workers.batch_size,
                        now,
                    })
                    .await?;
                if moved > 0 {
                    debug!(queue = %queue, group = ?group, moved, "requeued messages promoted");
                }
                promoted += moved as usize;
            }
        }
        Ok(promoted)
    }
}
