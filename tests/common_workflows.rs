//! Integration tests for common Quiver workflows.
//!
//! These tests drive a broker on the in-memory store through its public API
//! the way an application would.

use quiver::prelude::*;
use quiver::quiver_queue::{
    DeadLetterReason, ManualClock, MessageAuditConfig, QueueCounters, UnackAction,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// 2024-01-01T00:00:00Z
const T0: i64 = 1_704_067_200_000;

/// Route broker logs to the test harness; `RUST_LOG` selects what shows.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn setup(config: BrokerConfig) -> (Broker, Arc<ManualClock>, QueueParams) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(T0));
    let broker = Broker::with_clock(config, Arc::new(MemoryStore::new()), clock.clone()).unwrap();
    let queue = QueueParams::new("shop", "q1").unwrap();
    broker
        .queues()
        .create(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
        .await
        .unwrap();
    (broker, clock, queue)
}

async fn publish(broker: &Broker, message: MessageEnvelope) -> String {
    broker.producer().publish(message).await.unwrap().remove(0)
}

/// A consumer whose handler fails every message.
async fn failing_consumer(broker: &Broker, queue: &QueueParams) -> Consumer {
    let consumer = broker.consumer();
    consumer
        .consume(queue.clone(), None, |_| async {
            Err(QueueError::HandlerFailed("rejected".into()))
        })
        .await
        .unwrap();
    consumer
}

async fn counters(broker: &Broker, queue: &QueueParams) -> QueueCounters {
    let stored = broker.queues().get_properties(queue).await.unwrap().counters;
    let counted = broker.queues().count_messages_by_status(queue).await.unwrap();
    assert_eq!(stored, counted);
    assert_eq!(stored.in_storage(), stored.messages);
    stored
}

// =============================================================================
// Message Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_publish_consume_acknowledge() {
    let (broker, _clock, queue) = setup(BrokerConfig::default()).await;
    let id = publish(
        &broker,
        MessageEnvelope::new(serde_json::json!({"order": 1})).to_queue(queue.clone()),
    )
    .await;
    assert_eq!(
        broker.messages().get(&id).await.unwrap().state.status,
        MessageStatus::Pending
    );

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer = broker.consumer();
    consumer
        .consume(queue.clone(), None, move |message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(message.state.status);
                Ok(())
            }
        })
        .await
        .unwrap();
    assert!(consumer.poll_once().await.unwrap());

    assert_eq!(*seen.lock(), vec![MessageStatus::Processing]);
    let message = broker.messages().get(&id).await.unwrap();
    assert_eq!(message.state.status, MessageStatus::Acknowledged);
    assert!(message.state.processing_started_at.is_some());

    let counters = counters(&broker, &queue).await;
    assert_eq!((counters.pending, counters.acknowledged), (0, 1));
}

#[tokio::test]
async fn test_failed_message_is_retried_after_its_delay() {
    let (broker, clock, queue) = setup(BrokerConfig::default()).await;
    let id = publish(
        &broker,
        MessageEnvelope::new(serde_json::json!(2))
            .to_queue(queue.clone())
            .with_retry_delay(Duration::from_millis(5_000)),
    )
    .await;

    let mut events = broker.subscribe();
    let consumer = failing_consumer(&broker, &queue).await;
    assert!(consumer.poll_once().await.unwrap());
    assert_eq!(
        broker.messages().get(&id).await.unwrap().state.status,
        MessageStatus::UnackDelaying
    );
    let delayed = std::iter::from_fn(|| events.try_recv().ok()).any(|event| {
        matches!(
            event,
            BrokerEvent::MessageUnacknowledged {
                action: UnackAction::Delay,
                ..
            }
        )
    });
    assert!(delayed);

    let workers = broker.workers();
    workers.run_once().await.unwrap();
    assert_eq!(counters(&broker, &queue).await.delayed, 1);

    clock.advance(5_001);
    workers.run_once().await.unwrap();
    let message = broker.messages().get(&id).await.unwrap();
    assert_eq!(message.state.status, MessageStatus::Pending);
    assert_eq!(message.state.attempts, 1);
    assert_eq!(counters(&broker, &queue).await.pending, 1);
}

#[tokio::test]
async fn test_zero_threshold_dead_letters_on_first_failure() {
    let (broker, _clock, queue) = setup(BrokerConfig::default()).await;
    let id = publish(
        &broker,
        MessageEnvelope::new(serde_json::json!(3))
            .to_queue(queue.clone())
            .with_retry_threshold(0),
    )
    .await;

    let consumer = failing_consumer(&broker, &queue).await;
    assert!(consumer.poll_once().await.unwrap());

    let message = broker.messages().get(&id).await.unwrap();
    assert_eq!(message.state.status, MessageStatus::DeadLettered);
    assert_eq!(
        message.state.dead_lettered_reason,
        Some(DeadLetterReason::RetryThresholdExceeded)
    );
    let counters = counters(&broker, &queue).await;
    assert_eq!(
        (counters.delayed, counters.requeued, counters.dead_lettered),
        (0, 0, 1)
    );
}

#[tokio::test]
async fn test_exhausted_attempts_dead_letter_regardless_of_delay() {
    let (broker, clock, queue) = setup(BrokerConfig::default()).await;
    let id = publish(
        &broker,
        MessageEnvelope::new(serde_json::json!(4))
            .to_queue(queue.clone())
            .with_retry_threshold(2)
            .with_retry_delay(Duration::from_millis(1_000)),
    )
    .await;

    let consumer = failing_consumer(&broker, &queue).await;
    let workers = broker.workers();
    for _ in 0..2 {
        assert!(consumer.poll_once().await.unwrap());
        clock.advance(1_001);
        workers.run_once().await.unwrap();
    }
    assert_eq!(broker.messages().get(&id).await.unwrap().state.attempts, 2);

    assert!(consumer.poll_once().await.unwrap());
    let message = broker.messages().get(&id).await.unwrap();
    assert_eq!(message.state.status, MessageStatus::DeadLettered);
    assert_eq!(counters(&broker, &queue).await.dead_lettered, 1);
}

#[tokio::test]
async fn test_failed_periodic_message_keeps_its_schedule() {
    let (broker, clock, queue) = setup(BrokerConfig::default()).await;
    publish(
        &broker,
        MessageEnvelope::new(serde_json::json!("report"))
            .with_id("nightly")
            .to_queue(queue.clone())
            .with_cron("0 * * * * *")
            .unwrap(),
    )
    .await;

    let workers = broker.workers();
    clock.advance(60_000);
    workers.run_once().await.unwrap();

    let consumer = failing_consumer(&broker, &queue).await;
    assert!(consumer.poll_once().await.unwrap());

    let dead = broker
        .messages()
        .list(&queue, MessageListing::DeadLettered, 0, 10)
        .await
        .unwrap();
    assert_eq!(dead.total, 1);
    let child = &dead.items[0];
    assert_eq!(
        child.state.dead_lettered_reason,
        Some(DeadLetterReason::PeriodicMessage)
    );
    assert_eq!(child.state.scheduled_message_parent_id.as_deref(), Some("nightly"));

    let parent = broker.messages().get("nightly").await.unwrap();
    assert_eq!(parent.state.status, MessageStatus::Scheduled);

    clock.advance(60_000);
    workers.run_once().await.unwrap();
    let counters = counters(&broker, &queue).await;
    assert_eq!(
        (counters.scheduled, counters.pending, counters.dead_lettered),
        (1, 1, 1)
    );
}

#[tokio::test]
async fn test_requeue_finished_message_by_id() {
    let (broker, _clock, queue) = setup(BrokerConfig::default()).await;
    let id = publish(
        &broker,
        MessageEnvelope::new(serde_json::json!(5))
            .to_queue(queue.clone())
            .with_retry_threshold(0),
    )
    .await;
    let pending = publish(
        &broker,
        MessageEnvelope::new(serde_json::json!(6)).to_queue(queue.clone()),
    )
    .await;

    let consumer = failing_consumer(&broker, &queue).await;
    assert!(consumer.poll_once().await.unwrap());
    assert_eq!(
        broker.messages().get(&id).await.unwrap().state.status,
        MessageStatus::DeadLettered
    );

    let child_id = broker.messages().requeue_by_id(&id).await.unwrap();
    assert_ne!(child_id, id);
    let child = broker.messages().get(&child_id).await.unwrap();
    assert_eq!(child.state.status, MessageStatus::Pending);
    assert_eq!(child.state.requeued_message_parent_id.as_deref(), Some(id.as_str()));

    assert!(matches!(
        broker.messages().requeue_by_id(&pending).await,
        Err(QueueError::MessageNotRequeuable(_))
    ));
    let counters = counters(&broker, &queue).await;
    assert_eq!((counters.pending, counters.dead_lettered), (2, 1));
}

#[tokio::test]
async fn test_audit_expiry_config_is_accepted() {
    let config = BrokerConfig::builder()
        .dead_lettered(MessageAuditConfig::default().with_expire(Duration::from_secs(3_600)))
        .build();
    let (broker, _clock, queue) = setup(config).await;
    publish(
        &broker,
        MessageEnvelope::new(serde_json::json!(7))
            .to_queue(queue.clone())
            .with_retry_threshold(0),
    )
    .await;
    let consumer = failing_consumer(&broker, &queue).await;
    assert!(consumer.poll_once().await.unwrap());
    assert_eq!(counters(&broker, &queue).await.dead_lettered, 1);
}

// =============================================================================
// Purge Job Tests
// =============================================================================

#[tokio::test]
async fn test_purge_job_runs_on_the_worker_cluster() {
    let config = BrokerConfig::builder()
        .purge_batch_size(100)
        .batch_delay(Duration::ZERO)
        .build();
    let (broker, _clock, queue) = setup(config).await;
    for i in 0..250 {
        publish(
            &broker,
            MessageEnvelope::new(serde_json::json!(i)).to_queue(queue.clone()),
        )
        .await;
    }

    let job = broker.purge_queue(&queue, PurgeScope::All).await.unwrap();
    broker.workers().run_once().await.unwrap();

    let done = broker.jobs().get(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress["total_purged"], 250);
    assert_eq!(done.progress["batches"], 3);
    assert!(
        !broker
            .jobs()
            .target_lock(&queue.to_string())
            .is_locked()
            .await
            .unwrap()
    );
    assert_eq!(counters(&broker, &queue).await.messages, 0);
}

#[tokio::test]
async fn test_concurrent_purges_have_one_winner() {
    let (broker, _clock, queue) = setup(BrokerConfig::default()).await;
    let (first, second) = tokio::join!(
        broker.purge_queue(&queue, PurgeScope::All),
        broker.purge_queue(&queue, PurgeScope::Pending),
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(QueueError::Job(JobError::TargetLocked(_)))
    )));
}

#[tokio::test]
async fn test_cancelled_purge_stops_and_never_completes() {
    let config = BrokerConfig::builder()
        .purge_batch_size(1)
        .batch_delay(Duration::from_millis(50))
        .tick_interval(Duration::from_millis(10))
        .build();
    init_tracing();
    let broker = Broker::new(config, Arc::new(MemoryStore::new())).unwrap();
    let queue = QueueParams::new("shop", "bulk").unwrap();
    broker
        .queues()
        .create(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
        .await
        .unwrap();
    for i in 0..20 {
        publish(
            &broker,
            MessageEnvelope::new(serde_json::json!(i)).to_queue(queue.clone()),
        )
        .await;
    }

    let cluster = broker.workers();
    assert!(cluster.start().await.unwrap());
    let job = broker.purge_queue(&queue, PurgeScope::All).await.unwrap();

    let jobs = broker.jobs();
    tokio::time::timeout(Duration::from_secs(5), async {
        while jobs.get(&job.id).await.unwrap().status != JobStatus::Processing {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    jobs.cancel(&job.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(jobs.get(&job.id).await.unwrap().status, JobStatus::Canceled);
    let remaining = counters(&broker, &queue).await.pending;
    assert!(remaining > 0 && remaining < 20);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters(&broker, &queue).await.pending, remaining);
    cluster.shutdown().await.unwrap();
}

// =============================================================================
// Worker Cluster Tests
// =============================================================================

#[tokio::test]
async fn test_only_one_cluster_member_is_active() {
    init_tracing();
    let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryStore::new())).unwrap();
    let members: Vec<_> = (0..3).map(|_| broker.workers()).collect();

    let mut active = 0;
    for member in &members {
        if member.start().await.unwrap() {
            active += 1;
        }
    }
    assert_eq!(active, 1);
    for member in &members {
        member.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_consumer_lifecycle_events() {
    let config = BrokerConfig::builder()
        .poll_interval(Duration::from_millis(10))
        .build();
    init_tracing();
    let broker = Broker::new(config, Arc::new(MemoryStore::new())).unwrap();
    let queue = QueueParams::new("shop", "events").unwrap();
    broker
        .queues()
        .create(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
        .await
        .unwrap();

    let mut events = broker.subscribe();
    let handled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&handled);
    let consumer = broker.consumer();
    consumer
        .consume(queue.clone(), None, move |_| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    assert!(consumer.start().await.unwrap());
    publish(
        &broker,
        MessageEnvelope::new(serde_json::json!("hi")).to_queue(queue.clone()),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while !handled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    consumer.shutdown().await.unwrap();

    let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(seen.iter().any(|e| matches!(e, BrokerEvent::ConsumerUp { .. })));
    assert!(seen.iter().any(|e| matches!(e, BrokerEvent::ConsumerDown { .. })));
}
