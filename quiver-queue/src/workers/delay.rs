//! Delayed to pending promotion.

use async_trait::async_trait;
use quiver_redis::StoreExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Worker, queue_targets};
use crate::broker::BrokerContext;
use crate::error::QueueResult;
use crate::scripts::PromoteDelayed;

/// Moves messages whose retry delay elapsed back to pending.
pub(crate) struct DelayWorker {
    ctx: Arc<BrokerContext>,
}

impl DelayWorker {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Worker for DelayWorker {
    fn name(&self) -> &str {
        "delay"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.workers.tick_interval
    }

    async fn tick(&self) -> QueueResult<usize> {
        let now = self.ctx.now();
        let batch = self.ctx.config.workers.batch_size as u64;
        let mut promoted = 0;
        for (queue, targets) in queue_targets(&self.ctx).await? {
            for group in targets {
                let key = self.ctx.keys.delayed(&queue, group.as_deref());
                let ids = self
                    .ctx
                    .store
                    .zrangebyscore(&key, i64::MIN, now, 0, batch)
                    .await?;
                if ids.is_empty() {
                    continue;
                }
                let moved = self
                    .ctx
                    .store
                    .call(&PromoteDelayed {
                        keys: &self.ctx.keys,
                        queue: &queue,
                        group: group.as_deref(),
                        now,
                        ids: &ids,
                    })
                    .await?;
                debug!(queue = %queue, group = ?group, moved, "delayed messages promoted");
                promoted += moved as usize;
            }
        }
        Ok(promoted)
    }
}
