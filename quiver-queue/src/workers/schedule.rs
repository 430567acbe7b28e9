//! Scheduled to pending promotion.
//!
//! A one-shot delayed message moves to pending itself. A periodic message
//! stays in the scheduled set as the parent of its firings: every due
//! firing publishes a child and re-scores the parent at the next fire time,
//! or removes it after the last one.

use async_trait::async_trait;
use quiver_redis::StoreExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::Worker;
use crate::broker::BrokerContext;
use crate::error::{QueueError, QueueResult};
use crate::events::BrokerEvent;
use crate::message::MessageEnvelope;
use crate::message_manager::MessageManager;
use crate::queue::{QueueParams, QueueRegistry};
use crate::scripts::{PromoteScheduled, ScheduleMode};

/// Delivers due scheduled messages.
pub(crate) struct ScheduleWorker {
    ctx: Arc<BrokerContext>,
}

impl ScheduleWorker {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    async fn promote(&self, queue: &QueueParams, message: &MessageEnvelope, now: i64) -> QueueResult<bool> {
        let mode = if message.schedule.is_periodic() {
            let (next_at, repeat_position) = message
                .schedule
                .next_delivery_at(now, message.state.scheduled_repeat_count)?;
            let child = message.scheduled_child(now);
            ScheduleMode::Child {
                id: child.id.clone(),
                fields: child.to_fields()?,
                next_at,
                repeat_position,
            }
        } else {
            ScheduleMode::InPlace
        };
        let child_id = match &mode {
            ScheduleMode::InPlace => message.id.clone(),
            ScheduleMode::Child { id, .. } => id.clone(),
        };

        let promoted = self
            .ctx
            .store
            .call(&PromoteScheduled {
                keys: &self.ctx.keys,
                queue,
                group: message.consumer_group_id.as_deref(),
                parent_id: &message.id,
                priority: message.priority,
                now,
                mode,
            })
            .await?;
        if promoted {
            debug!(queue = %queue, message_id = %message.id, delivered = %child_id, "scheduled message delivered");
            self.ctx.events.emit(BrokerEvent::MessagePublished {
                queue: queue.clone(),
                message_id: child_id,
                consumer_group: message.consumer_group_id.clone(),
            });
        }
        Ok(promoted)
    }
}

#[async_trait]
impl Worker for ScheduleWorker {
    fn name(&self) -> &str {
        "schedule"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.workers.tick_interval
    }

    async fn tick(&self) -> QueueResult<usize> {
        let now = self.ctx.now();
        let batch = self.ctx.config.workers.batch_size as u64;
        let messages = MessageManager::new(Arc::clone(&self.ctx));
        let mut promoted = 0;

        for queue in QueueRegistry::new(Arc::clone(&self.ctx)).list().await? {
            let due = self
                .ctx
                .store
                .zrangebyscore(&self.ctx.keys.scheduled(&queue), i64::MIN, now, 0, batch)
                .await?;
            for message in messages.get_many(&due).await? {
                match self.promote(&queue, &message, now).await {
                    Ok(true) => promoted += 1,
                    Ok(false) => {}
                    Err(e @ (QueueError::QueueNotFound(_) | QueueError::MessageAlreadyExists(_))) => {
                        warn!(queue = %queue, message_id = %message.id, error = %e, "scheduled message skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(promoted)
    }
}
