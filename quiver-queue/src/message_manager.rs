//! Message inspection, deletion and requeue.
//!
//! Listings page through whatever structure holds messages of a given
//! status. FIFO and LIFO pending messages live in lists; priority pending,
//! scheduled, delayed and audit stores are sorted sets. [`Storage`] hides
//! the difference.

use quiver_redis::{Store, StoreExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::BrokerContext;
use crate::error::{QueueError, QueueResult};
use crate::events::BrokerEvent;
use crate::message::MessageEnvelope;
use crate::queue::{QueueParams, QueueRegistry, QueueType};
use crate::scripts::{DeleteMessages, DeleteOutcome, DeleteTarget, RequeueMessage};

/// Messages of one status in one queue (or consumer group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageListing {
    /// Waiting for a consumer.
    Pending { group: Option<String> },
    /// Waiting for a retry in the delayed set.
    Delayed { group: Option<String> },
    /// Waiting for a retry in the requeued list.
    Requeued { group: Option<String> },
    /// Waiting for their delivery time.
    Scheduled,
    /// Retained after acknowledgment.
    Acknowledged,
    /// Retained after dead-lettering.
    DeadLettered,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    /// Messages on this page.
    pub items: Vec<MessageEnvelope>,
    /// Size of the whole listing.
    pub total: u64,
    /// Offset of the first item.
    pub offset: u64,
}

/// A structure holding message ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Storage {
    List(String),
    SortedSet(String),
}

impl Storage {
    /// Ids at `offset..offset + count`, newest-inserted first for lists and
    /// lowest score first for sorted sets.
    pub async fn page(&self, store: &dyn Store, offset: u64, count: u64) -> QueueResult<Vec<String>> {
        let Some((start, stop)) = page_bounds(offset, count) else {
            return Ok(Vec::new());
        };
        Ok(match self {
            Storage::List(key) => store.lrange(key, start, stop).await?,
            Storage::SortedSet(key) => store.zrange(key, start, stop).await?,
        })
    }

    /// Number of ids held.
    pub async fn len(&self, store: &dyn Store) -> QueueResult<u64> {
        Ok(match self {
            Storage::List(key) => store.llen(key).await?,
            Storage::SortedSet(key) => store.zcard(key).await?,
        })
    }
}

/// Inclusive range indexes for a page, `None` when it is empty or starts
/// past any index a store can hold.
fn page_bounds(offset: u64, count: u64) -> Option<(i64, i64)> {
    let last = count.checked_sub(1)?;
    let start = i64::try_from(offset).ok()?;
    let stop = i64::try_from(offset.saturating_add(last)).unwrap_or(i64::MAX);
    Some((start, stop))
}

/// Reads, deletes and requeues individual messages.
#[derive(Clone)]
pub struct MessageManager {
    ctx: Arc<BrokerContext>,
}

impl MessageManager {
    pub(crate) fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Load a message.
    pub async fn get(&self, id: &str) -> QueueResult<MessageEnvelope> {
        let fields = self.ctx.store.hgetall(&self.ctx.keys.message(id)).await?;
        if fields.is_empty() {
            return Err(QueueError::MessageNotFound(id.to_string()));
        }
        MessageEnvelope::from_fields(&fields)
    }

    /// Load several messages, skipping ids that no longer exist.
    pub async fn get_many(&self, ids: &[String]) -> QueueResult<Vec<MessageEnvelope>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(id).await {
                Ok(message) => messages.push(message),
                Err(QueueError::MessageNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(messages)
    }

    /// Delete a message that is not being processed.
    pub async fn delete(&self, id: &str) -> QueueResult<()> {
        let message = self.get(id).await?;
        let target = DeleteTarget {
            id: id.to_string(),
            queue: message.queue()?.clone(),
            group: message.consumer_group_id,
        };
        let outcome = self.delete_many(std::slice::from_ref(&target)).await?;
        match outcome.first().map(|(_, outcome)| *outcome) {
            Some(DeleteOutcome::Deleted) => Ok(()),
            Some(DeleteOutcome::InProcess) => Err(QueueError::MessageInProcess(id.to_string())),
            Some(DeleteOutcome::NotFound) => Err(QueueError::MessageNotFound(id.to_string())),
            None => Err(QueueError::ContractViolation(
                "delete replied without a result".into(),
            )),
        }
    }

    pub(crate) async fn delete_many(
        &self,
        targets: &[DeleteTarget],
    ) -> QueueResult<Vec<(String, DeleteOutcome)>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let outcome = self
            .ctx
            .store
            .call(&DeleteMessages {
                keys: &self.ctx.keys,
                targets,
            })
            .await?;
        debug!(
            deleted = outcome.iter().filter(|(_, o)| *o == DeleteOutcome::Deleted).count(),
            requested = targets.len(),
            "messages deleted"
        );
        Ok(outcome)
    }

    /// Publish a fresh copy of an acknowledged or dead-lettered message.
    ///
    /// The copy gets a new id pointing back at the original, which is only
    /// stamped with the requeue time. Returns the new id.
    pub async fn requeue_by_id(&self, id: &str) -> QueueResult<String> {
        let message = self.get(id).await?;
        if !message.state.status.is_requeuable() {
            return Err(QueueError::MessageNotRequeuable(id.to_string()));
        }
        let now = self.ctx.now();
        let child = message.requeued_child(now);
        let queue = child.queue()?;
        self.ctx
            .store
            .call(&RequeueMessage {
                keys: &self.ctx.keys,
                queue,
                group: child.consumer_group_id.as_deref(),
                source_id: id,
                child_id: &child.id,
                priority: child.priority,
                now,
                fields: child.to_fields()?,
            })
            .await?;
        info!(queue = %queue, message_id = %id, child_id = %child.id, "message requeued");
        self.ctx.events.emit(BrokerEvent::MessageRequeued {
            queue: queue.clone(),
            message_id: child.id.clone(),
            parent_id: Some(id.to_string()),
        });
        Ok(child.id)
    }

    pub(crate) async fn storage(
        &self,
        queue: &QueueParams,
        listing: &MessageListing,
    ) -> QueueResult<Storage> {
        let keys = &self.ctx.keys;
        Ok(match listing {
            MessageListing::Pending { group } => {
                let props = QueueRegistry::new(Arc::clone(&self.ctx))
                    .get_properties(queue)
                    .await?;
                if props.queue_type == QueueType::Priority {
                    Storage::SortedSet(keys.priority_pending(queue, group.as_deref()))
                } else {
                    Storage::List(keys.pending(queue, group.as_deref()))
                }
            }
            MessageListing::Delayed { group } => {
                Storage::SortedSet(keys.delayed(queue, group.as_deref()))
            }
            MessageListing::Requeued { group } => Storage::List(keys.requeued(queue, group.as_deref())),
            MessageListing::Scheduled => Storage::SortedSet(keys.scheduled(queue)),
            MessageListing::Acknowledged => Storage::SortedSet(keys.acknowledged(queue)),
            MessageListing::DeadLettered => Storage::SortedSet(keys.dead_lettered(queue)),
        })
    }

    /// One page of a listing.
    pub async fn list(
        &self,
        queue: &QueueParams,
        listing: MessageListing,
        offset: u64,
        count: u64,
    ) -> QueueResult<MessagePage> {
        let storage = self.storage(queue, &listing).await?;
        let store = self.ctx.store.as_ref();
        let ids = storage.page(store, offset, count).await?;
        Ok(MessagePage {
            items: self.get_many(&ids).await?,
            total: storage.len(store).await?,
            offset,
        })
    }
}
