//! Broker configuration.

use quiver_redis::{KeyScheme, validate_name};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{QueueError, QueueResult};

/// Upper bound for worker batches.
pub const MAX_WORKER_BATCH_SIZE: usize = 100;

/// Upper bound on heartbeat write attempts.
pub const MAX_HEARTBEAT_RETRIES: u32 = 10;

/// Retention of the acknowledged or dead-lettered audit store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAuditConfig {
    /// Keep finished messages for inspection. When off, records are deleted.
    pub enabled: bool,
    /// Maximum retained messages (0 = unbounded).
    pub max_size: u64,
    /// Maximum retention (zero = forever).
    #[serde(with = "duration_ms", default)]
    pub expire: Duration,
}

impl Default for MessageAuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 0,
            expire: Duration::ZERO,
        }
    }
}

impl MessageAuditConfig {
    /// Audit disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Bound the number of retained messages.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Bound retention time.
    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Pause after a full round over all queues found nothing.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Heartbeat refresh period.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Heartbeat key TTL; a consumer without a live heartbeat is offline.
    #[serde(with = "duration_ms")]
    pub heartbeat_ttl: Duration,
    /// Attempts per heartbeat write.
    pub heartbeat_retries: u32,
    /// Release in-flight messages when the consumer shuts down.
    pub release_on_shutdown: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_ttl: Duration::from_secs(10),
            heartbeat_retries: 3,
            release_on_shutdown: true,
        }
    }
}

/// Maintenance worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Tick period of the delay, schedule, requeue and job workers.
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Messages handled per queue per tick.
    pub batch_size: usize,
    /// Tick period of the consumer reaper.
    #[serde(with = "duration_ms")]
    pub reaper_interval: Duration,
    /// TTL of the single-active-instance election.
    #[serde(with = "duration_ms")]
    pub leader_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            batch_size: MAX_WORKER_BATCH_SIZE,
            reaper_interval: Duration::from_secs(10),
            leader_ttl: Duration::from_secs(30),
        }
    }
}

/// Background job settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// TTL of a job's target lock, extended after every batch.
    #[serde(with = "duration_ms")]
    pub lock_ttl: Duration,
    /// Messages deleted per purge batch.
    pub purge_batch_size: u64,
    /// Pause between batches.
    #[serde(with = "duration_ms")]
    pub batch_delay: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            purge_batch_size: 100,
            batch_delay: Duration::ZERO,
        }
    }
}

/// Broker configuration.
///
/// Constructed once and handed to [`Broker::new`](crate::Broker::new);
/// every component reads its settings from there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Default namespace for queues addressed without one.
    pub namespace: String,
    /// Key prefix and schema version.
    pub keys: KeyScheme,
    /// Acknowledged audit store.
    pub acknowledged: MessageAuditConfig,
    /// Dead-lettered audit store.
    pub dead_lettered: MessageAuditConfig,
    /// Consumer settings.
    pub consumer: ConsumerConfig,
    /// Worker settings.
    pub workers: WorkerConfig,
    /// Background job settings.
    pub jobs: JobConfig,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            keys: KeyScheme::default(),
            acknowledged: MessageAuditConfig::default(),
            dead_lettered: MessageAuditConfig::default(),
            consumer: ConsumerConfig::default(),
            workers: WorkerConfig::default(),
            jobs: JobConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl BrokerConfig {
    /// Create a builder.
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::new()
    }

    /// Load configuration from `QUIVER_*` environment variables.
    pub fn from_env() -> BrokerConfigBuilder {
        let mut builder = BrokerConfigBuilder::new();

        if let Ok(ns) = std::env::var("QUIVER_NAMESPACE") {
            builder = builder.namespace(ns);
        }

        if let Ok(prefix) = std::env::var("QUIVER_KEY_PREFIX") {
            builder = builder.key_prefix(prefix);
        }

        if let Some(ms) = env_u64("QUIVER_POLL_INTERVAL_MS") {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }

        if let Some(ms) = env_u64("QUIVER_HEARTBEAT_TTL_MS") {
            builder = builder.heartbeat_ttl(Duration::from_millis(ms));
        }

        if let Some(ms) = env_u64("QUIVER_REAPER_INTERVAL_MS") {
            builder = builder.reaper_interval(Duration::from_millis(ms));
        }

        if let Some(size) = env_u64("QUIVER_WORKER_BATCH_SIZE") {
            builder = builder.batch_size(size as usize);
        }

        if let Ok(flag) = std::env::var("QUIVER_ACK_AUDIT")
            && let Ok(enabled) = flag.parse()
        {
            builder.config.acknowledged.enabled = enabled;
        }

        if let Ok(flag) = std::env::var("QUIVER_DEAD_LETTER_AUDIT")
            && let Ok(enabled) = flag.parse()
        {
            builder.config.dead_lettered.enabled = enabled;
        }

        builder
    }

    /// Check the settings.
    pub fn validate(&self) -> QueueResult<()> {
        validate_name(&self.namespace)?;
        if self.keys.prefix.is_empty() || self.keys.prefix.contains(':') {
            return Err(QueueError::Config(format!(
                "invalid key prefix '{}'",
                self.keys.prefix
            )));
        }
        if self.workers.batch_size == 0 || self.workers.batch_size > MAX_WORKER_BATCH_SIZE {
            return Err(QueueError::Config(format!(
                "worker batch size must be within 1..={}",
                MAX_WORKER_BATCH_SIZE
            )));
        }
        if self.consumer.heartbeat_ttl <= self.consumer.heartbeat_interval {
            return Err(QueueError::Config(
                "heartbeat_ttl must exceed heartbeat_interval".into(),
            ));
        }
        if self.consumer.heartbeat_retries > MAX_HEARTBEAT_RETRIES {
            return Err(QueueError::Config(format!(
                "heartbeat retries must be at most {}",
                MAX_HEARTBEAT_RETRIES
            )));
        }
        if self.consumer.poll_interval.is_zero() || self.workers.tick_interval.is_zero() {
            return Err(QueueError::Config("intervals must be non-zero".into()));
        }
        if self.jobs.purge_batch_size == 0 {
            return Err(QueueError::Config("purge batch size must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::Config("event capacity must be positive".into()));
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

/// Builder for broker configuration.
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
    config: BrokerConfig,
}

impl BrokerConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.keys.prefix = prefix.into();
        self
    }

    /// Set the acknowledged audit store.
    pub fn acknowledged(mut self, audit: MessageAuditConfig) -> Self {
        self.config.acknowledged = audit;
        self
    }

    /// Set the dead-lettered audit store.
    pub fn dead_lettered(mut self, audit: MessageAuditConfig) -> Self {
        self.config.dead_lettered = audit;
        self
    }

    /// Set the consumer poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.consumer.poll_interval = interval;
        self
    }

    /// Set the heartbeat refresh period.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.consumer.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat TTL.
    pub fn heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.config.consumer.heartbeat_ttl = ttl;
        self
    }

    /// Set the worker tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.workers.tick_interval = interval;
        self
    }

    /// Set the reaper interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.workers.reaper_interval = interval;
        self
    }

    /// Set the worker batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.workers.batch_size = size;
        self
    }

    /// Set the job lock TTL.
    pub fn job_lock_ttl(mut self, ttl: Duration) -> Self {
        self.config.jobs.lock_ttl = ttl;
        self
    }

    /// Set the purge batch size.
    pub fn purge_batch_size(mut self, size: u64) -> Self {
        self.config.jobs.purge_batch_size = size;
        self
    }

    /// Set the pause between job batches.
    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.config.jobs.batch_delay = delay;
        self
    }

    /// Set the event channel capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> BrokerConfig {
        self.config
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = BrokerConfig::builder()
            .namespace("billing")
            .batch_size(10)
            .heartbeat_ttl(Duration::from_secs(30))
            .acknowledged(MessageAuditConfig::disabled())
            .build();
        assert_eq!(config.namespace, "billing");
        assert_eq!(config.workers.batch_size, 10);
        assert!(!config.acknowledged.enabled);
        assert!(config.dead_lettered.enabled);
    }

    #[test]
    fn test_validation_rejects_large_batches() {
        let config = BrokerConfig::builder().batch_size(101).build();
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn test_validation_rejects_short_heartbeat_ttl() {
        let config = BrokerConfig::builder()
            .heartbeat_interval(Duration::from_secs(5))
            .heartbeat_ttl(Duration::from_secs(5))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unbounded_heartbeat_retries() {
        let mut config = BrokerConfig::default();
        config.consumer.heartbeat_retries = MAX_HEARTBEAT_RETRIES;
        assert!(config.validate().is_ok());
        config.consumer.heartbeat_retries = 40;
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn test_validation_rejects_bad_namespace() {
        let config = BrokerConfig::builder().namespace("Bad Name").build();
        assert!(matches!(config.validate(), Err(QueueError::InvalidName(_))));
    }

    #[test]
    fn test_serde_durations_in_millis() {
        let config = BrokerConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["consumer"]["poll_interval"], 1000);
        let back: BrokerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
