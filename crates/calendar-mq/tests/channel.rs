//! Producer and consumer against the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use calendar_core::config::BrokerConfig;
use calendar_core::{CalendarError, Notification, Publisher, Result};
use calendar_mq::{Consumer, MemoryBroker, NotificationHandler, Producer};
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Recorder {
    tx: mpsc::UnboundedSender<Notification>,
}

#[async_trait]
impl NotificationHandler for Recorder {
    async fn handle(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .map_err(|e| CalendarError::Other(e.to_string()))
    }
}

fn notification(title: &str) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        title: title.to_string(),
        start: Utc.with_ymd_and_hms(2030, 6, 1, 9, 0, 0).unwrap(),
        user_id: Uuid::new_v4(),
    }
}

fn spawn_consumer(
    consumer: Arc<Consumer>,
    cancel: CancellationToken,
) -> (JoinHandle<Result<()>>, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move { consumer.handle(&Recorder { tx }, &cancel).await });
    (task, rx)
}

async fn producer(broker: &MemoryBroker, config: &BrokerConfig) -> Producer {
    Producer::connect(Arc::new(broker.clone()), config, &CancellationToken::new())
        .await
        .unwrap()
}

async fn consumer(broker: &MemoryBroker, config: &BrokerConfig) -> Arc<Consumer> {
    Arc::new(
        Consumer::connect(Arc::new(broker.clone()), config, &CancellationToken::new())
            .await
            .unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_publish_then_consume() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig::default();
    let consumer = consumer(&broker, &config).await;
    let producer = producer(&broker, &config).await;
    let cancel = CancellationToken::new();
    let (task, mut received) = spawn_consumer(consumer.clone(), cancel.clone());

    let n = notification("standup");
    producer.publish(&n.to_payload().unwrap()).await.unwrap();
    assert_eq!(received.recv().await.unwrap(), n);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "calendar");
    assert_eq!(published[0].routing_key, "notification");

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(broker.unacked(), 0);

    producer.shutdown().await.unwrap();
    consumer.shutdown().await.unwrap();
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_nack_is_reported() {
    let broker = MemoryBroker::new();
    let producer = producer(&broker, &BrokerConfig::default()).await;
    broker.set_nack(true);

    let err = producer.publish(b"{}").await.unwrap_err();
    assert!(matches!(err, CalendarError::NotAcknowledged));
    assert!(!err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_slow_confirm_times_out() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig { confirm_timeout_ms: 1_000, ..BrokerConfig::default() };
    let producer = producer(&broker, &config).await;
    broker.set_confirm_delay(Duration::from_secs(10));

    let err = producer.publish(b"{}").await.unwrap_err();
    assert!(matches!(err, CalendarError::ConfirmTimeout(d) if d == Duration::from_secs(1)));
}

#[tokio::test(start_paused = true)]
async fn test_unreliable_publish_skips_confirms() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig { reliable: false, ..BrokerConfig::default() };
    let producer = producer(&broker, &config).await;
    broker.set_nack(true);
    broker.set_confirm_delay(Duration::from_secs(3600));

    producer.publish(b"{}").await.unwrap();
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publish_survives_broker_restart() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig::default();
    let consumer = consumer(&broker, &config).await;
    let producer = producer(&broker, &config).await;
    let cancel = CancellationToken::new();
    let (task, mut received) = spawn_consumer(consumer.clone(), cancel.clone());

    let first = notification("before");
    producer.publish(&first.to_payload().unwrap()).await.unwrap();
    assert_eq!(received.recv().await.unwrap(), first);

    broker.refuse_connects(2);
    broker.disconnect_all();

    let second = notification("after");
    producer.publish(&second.to_payload().unwrap()).await.unwrap();
    assert_eq!(received.recv().await.unwrap(), second);
    // one initial connect each, one reconnect each
    assert_eq!(broker.connection_count(), 4);

    cancel.cancel();
    task.await.unwrap().unwrap();
    producer.shutdown().await.unwrap();
    consumer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publish_fails_once_retries_exhaust() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig { max_attempts: 3, ..BrokerConfig::default() };
    let producer = producer(&broker, &config).await;

    broker.refuse_connects(u32::MAX);
    broker.disconnect_all();

    let err = producer.publish(b"{}").await.unwrap_err();
    assert!(matches!(err, CalendarError::ConnectionExhausted { attempts: 3, .. }));
    assert!(err.is_fatal());
    producer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publish_after_shutdown() {
    let broker = MemoryBroker::new();
    let producer = producer(&broker, &BrokerConfig::default()).await;
    producer.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();
    assert!(matches!(producer.publish(b"{}").await, Err(CalendarError::Closed)));
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_delivery_is_not_acked() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig::default();
    let consumer = consumer(&broker, &config).await;
    let (task, _received) = spawn_consumer(consumer.clone(), CancellationToken::new());

    broker.inject("calendar", "notification", b"not json").unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, CalendarError::Decode(_)));
    assert_eq!(broker.unacked(), 1);

    // closing the session hands the message back for redelivery
    consumer.shutdown().await.unwrap();
    assert_eq!(broker.unacked(), 0);
    assert_eq!(broker.queue_depth("notifications"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unacked_delivery_is_redelivered_after_restart() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig::default();
    let first = consumer(&broker, &config).await;

    let failing = {
        struct Reject;
        #[async_trait]
        impl NotificationHandler for Reject {
            async fn handle(&self, _: Notification) -> Result<()> {
                Err(CalendarError::Other("handler unavailable".into()))
            }
        }
        let first = first.clone();
        tokio::spawn(async move { first.handle(&Reject, &CancellationToken::new()).await })
    };

    let n = notification("retry me");
    broker.inject("calendar", "notification", &n.to_payload().unwrap()).unwrap();
    assert!(failing.await.unwrap().is_err());
    first.shutdown().await.unwrap();

    let second = consumer(&broker, &config).await;
    let cancel = CancellationToken::new();
    let (task, mut received) = spawn_consumer(second.clone(), cancel.clone());
    assert_eq!(received.recv().await.unwrap(), n);

    cancel.cancel();
    task.await.unwrap().unwrap();
    second.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_consumer_requires_queue() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig { queue: String::new(), ..BrokerConfig::default() };
    let result = Consumer::connect(Arc::new(broker), &config, &CancellationToken::new()).await;
    assert!(matches!(result, Err(CalendarError::Config(_))));
}
