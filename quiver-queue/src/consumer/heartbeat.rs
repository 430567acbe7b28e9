//! Consumer heartbeats.
//!
//! A consumer is online while its heartbeat key exists. The key is written
//! with a TTL and refreshed well before it runs out; the reaper treats a
//! missing key as an offline consumer.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::broker::BrokerContext;
use crate::error::QueueResult;

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Delay before retry `attempt` (1-based): doubling from the base, capped.
fn backoff(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

/// Heartbeat writer of one consumer.
pub(crate) struct Heartbeat {
    ctx: Arc<BrokerContext>,
    consumer_id: String,
    key: String,
}

impl Heartbeat {
    pub fn new(ctx: Arc<BrokerContext>, consumer_id: &str) -> Self {
        let key = ctx.keys.heartbeat(consumer_id);
        Self {
            ctx,
            consumer_id: consumer_id.to_string(),
            key,
        }
    }

    /// Write the heartbeat, retrying with exponential backoff.
    pub async fn beat(&self) -> QueueResult<()> {
        let config = &self.ctx.config.consumer;
        let ttl = config.heartbeat_ttl.as_millis() as u64;
        let value = self.ctx.now().to_string();
        let attempts = config.heartbeat_retries.max(1);

        let mut attempt = 1;
        loop {
            match self.ctx.store.set_px(&self.key, &value, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    warn!(consumer_id = %self.consumer_id, attempt, error = %e, "heartbeat write failed, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the heartbeat.
    pub async fn clear(&self) -> QueueResult<()> {
        self.ctx.store.del(std::slice::from_ref(&self.key)).await?;
        Ok(())
    }

    /// Refresh the heartbeat until `stop` flips to `true`.
    pub async fn run(&self, mut stop: tokio::sync::watch::Receiver<bool>) {
        let interval = self.ctx.config.consumer.heartbeat_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            if *stop.borrow() {
                return;
            }
            if let Err(e) = self.beat().await {
                warn!(consumer_id = %self.consumer_id, error = %e, "heartbeat lost");
            }
        }
    }
}

/// Check if a consumer has a live heartbeat.
pub(crate) async fn is_alive(ctx: &BrokerContext, consumer_id: &str) -> QueueResult<bool> {
    Ok(ctx.store.exists(&ctx.keys.heartbeat(consumer_id)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff(1), Duration::from_millis(50));
        assert_eq!(backoff(2), Duration::from_millis(100));
        assert_eq!(backoff(4), Duration::from_millis(400));
        assert_eq!(backoff(6), BACKOFF_MAX);
        assert_eq!(backoff(40), BACKOFF_MAX);
        assert_eq!(backoff(u32::MAX), BACKOFF_MAX);
    }
}
