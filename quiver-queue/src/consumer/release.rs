//! Handing messages back from processing lists.

use quiver_redis::StoreExt;
use tracing::{debug, info};

use crate::broker::BrokerContext;
use crate::error::QueueResult;
use crate::events::BrokerEvent;
use crate::message::{UnackAction, UnackReason};
use crate::queue::QueueParams;
use crate::scripts::{HandleUnacknowledgment, UnackTarget};

/// Unacknowledge `targets` held by `consumer_id` and report the outcome.
pub(crate) async fn unacknowledge(
    ctx: &BrokerContext,
    queue: &QueueParams,
    consumer_id: &str,
    reason: UnackReason,
    targets: &[UnackTarget],
) -> QueueResult<Vec<(String, UnackAction)>> {
    if targets.is_empty() {
        return Ok(Vec::new());
    }
    let outcome = ctx
        .store
        .call(&HandleUnacknowledgment {
            keys: &ctx.keys,
            queue,
            consumer_id,
            reason,
            now: ctx.now(),
            audit: &ctx.config.dead_lettered,
            targets,
        })
        .await?;
    for (id, action) in &outcome {
        debug!(queue = %queue, message_id = %id, %reason, %action, "message unacknowledged");
        for event in BrokerEvent::for_unack(queue, id, reason, *action) {
            ctx.events.emit(event);
        }
    }
    Ok(outcome)
}

/// Unacknowledge every message in a consumer's processing list of `queue`.
///
/// With `only_group` set, messages fetched for other consumer groups stay
/// where they are. The registry entry is dropped once the list is empty.
/// Returns the number of messages handed back.
pub(crate) async fn release_processing(
    ctx: &BrokerContext,
    queue: &QueueParams,
    consumer_id: &str,
    reason: UnackReason,
    only_group: Option<&str>,
) -> QueueResult<usize> {
    let processing = ctx.keys.processing(queue, consumer_id);
    let ids = ctx.store.lrange(&processing, 0, -1).await?;

    let mut targets = Vec::with_capacity(ids.len());
    for id in ids {
        let group = ctx
            .store
            .hget(&ctx.keys.message(&id), "consumerGroupId")
            .await?;
        if only_group.is_some() && group.as_deref() != only_group {
            continue;
        }
        targets.push(UnackTarget { id, group });
    }

    let mut released = 0;
    for chunk in targets.chunks(ctx.config.workers.batch_size) {
        released += unacknowledge(ctx, queue, consumer_id, reason, chunk)
            .await?
            .iter()
            .filter(|(_, action)| *action != UnackAction::Skipped)
            .count();
    }

    if ctx.store.llen(&processing).await? == 0 {
        ctx.store
            .hdel(&ctx.keys.processing_registry(queue), consumer_id)
            .await?;
    }
    if released > 0 {
        info!(queue = %queue, consumer_id = %consumer_id, %reason, released, "released processing messages");
    }
    Ok(released)
}
