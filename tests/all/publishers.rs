use crate::helpers::{eventually, random_name, FakeBroker, Published};
use carrot_pools::pool::{BuildError, ConfigError};
use carrot_pools::publishers::{
    Confirmable, OutgoingMessage, PublisherError, PublishersPool, PublishersPoolBuilder, Routable,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Serialize)]
struct OrderEvent {
    order_id: u64,
    #[serde(skip)]
    routing_key: Option<String>,
    #[serde(skip)]
    confirmations: Option<mpsc::UnboundedSender<bool>>,
}

impl Routable for OrderEvent {
    fn routing_key(&self) -> String {
        self.routing_key.clone().unwrap_or_default()
    }
}

impl Confirmable for OrderEvent {
    fn confirm(&self, confirmed: bool) {
        if let Some(confirmations) = &self.confirmations {
            let _ = confirmations.send(confirmed);
        }
    }
}

impl OutgoingMessage for OrderEvent {
    fn routable(&self) -> Option<&dyn Routable> {
        self.routing_key.as_ref().map(|_| self as &dyn Routable)
    }

    fn confirmable(&self) -> Option<&dyn Confirmable> {
        self.confirmations.as_ref().map(|_| self as &dyn Confirmable)
    }
}

fn event(order_id: u64) -> OrderEvent {
    OrderEvent {
        order_id,
        routing_key: None,
        confirmations: None,
    }
}

fn builder(broker: &FakeBroker) -> PublishersPoolBuilder<OrderEvent, FakeBroker> {
    PublishersPool::builder(broker.clone()).exchange_name(random_name())
}

#[tokio::test(start_paused = true)]
async fn every_publisher_reports_the_revision_of_its_pool() {
    let broker = FakeBroker::new();
    let pool = builder(&broker).channel_count(3).build().await.unwrap();

    let snapshot = pool.snapshot().await.unwrap();

    assert_eq!(snapshot.len(), 3);
    assert_eq!(pool.size().await, 3);
    assert!(snapshot
        .worker_revisions()
        .into_iter()
        .all(|revision| revision == snapshot.revision()));
}

#[tokio::test(start_paused = true)]
async fn messages_are_published_with_their_routing_key() {
    // Arrange
    let broker = FakeBroker::new();
    let exchange = random_name();
    let pool = PublishersPool::builder(broker.clone())
        .exchange_name(&exchange)
        .build()
        .await
        .unwrap();

    // Act
    pool.publish(OrderEvent {
        routing_key: Some("orders.created".into()),
        ..event(1)
    })
    .await
    .unwrap();
    pool.publish(event(2)).await.unwrap();

    // Assert
    assert_eq!(
        broker.published(),
        vec![
            Published {
                exchange: exchange.clone(),
                routing_key: "orders.created".into(),
                payload: br#"{"order_id":1}"#.to_vec(),
            },
            Published {
                exchange,
                routing_key: "".into(),
                payload: br#"{"order_id":2}"#.to_vec(),
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn confirmations_are_reported_to_the_message() {
    let broker = FakeBroker::new();
    let pool = builder(&broker)
        .with_publisher_confirmation()
        .build()
        .await
        .unwrap();
    let (confirmations, mut confirmed) = mpsc::unbounded_channel();

    pool.publish(OrderEvent {
        confirmations: Some(confirmations.clone()),
        ..event(1)
    })
    .await
    .unwrap();
    assert_eq!(confirmed.recv().await, Some(true));

    broker.nack_publishes(true);
    pool.publish(OrderEvent {
        confirmations: Some(confirmations),
        ..event(2)
    })
    .await
    .unwrap();
    assert_eq!(confirmed.recv().await, Some(false));
}

#[tokio::test(start_paused = true)]
async fn encoding_failures_are_reported_without_reconnecting() {
    let broker = FakeBroker::new();
    let pool = PublishersPool::builder_with_encoder(
        broker.clone(),
        Arc::new(|_: &String| -> Result<Vec<u8>, anyhow::Error> {
            Err(anyhow::anyhow!("Unsupported message"))
        }),
    )
    .exchange_name(random_name())
    .build()
    .await
    .unwrap();

    let outcome = pool.publish("hello".to_string()).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(matches!(outcome, Err(PublisherError::Encode(_))));
    assert!(broker.published().is_empty());
    assert_eq!(broker.connects(), 1);
    assert_eq!(pool.size().await, 2);
}

#[tokio::test(start_paused = true)]
async fn channels_failing_together_trigger_a_single_reconnection() {
    // Arrange
    let broker = FakeBroker::new();
    let pool = builder(&broker).build().await.unwrap();
    let before = pool.snapshot().await.unwrap().revision();

    // Act
    broker.break_all_channels();

    // Assert
    let pool = &pool;
    eventually(|| async move {
        pool.snapshot()
            .await
            .map_or(false, |snapshot| snapshot.revision() > before)
    })
    .await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(broker.connects(), 2);
    assert_eq!(broker.open_channels(), 2);
    assert_eq!(pool.size().await, 2);
    pool.publish(event(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn publishing_while_disconnected_fails_straight_away() {
    let broker = FakeBroker::new();
    let pool = builder(&broker).build().await.unwrap();
    let pool = &pool;

    broker.refuse_connections(true);
    broker.break_all_channels();
    eventually(|| async move { pool.size().await == 0 }).await;

    let started = Instant::now();
    let outcome = pool.publish(event(1)).await;
    assert!(matches!(outcome, Err(PublisherError::ConnectionClosed)));
    assert!(started.elapsed() < Duration::from_millis(100));

    // The pool keeps retrying in the background.
    broker.refuse_connections(false);
    eventually(|| async move { pool.size().await == 2 }).await;
    pool.publish(event(2)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn publishing_times_out_when_every_publisher_is_busy() {
    // Arrange
    let broker = FakeBroker::new();
    let pool = Arc::new(
        builder(&broker)
            .channel_count(1)
            .publish_timeout(Duration::from_secs(1))
            .build()
            .await
            .unwrap(),
    );
    broker.hang_publishes(true);
    let stuck = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.publish(event(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Act
    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(10), pool.publish(event(2)))
        .await
        .expect("publish must give up once its timeout expires");
    let elapsed = started.elapsed();

    // Assert
    assert!(outcome.unwrap_err().is_timeout());
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1100), "{elapsed:?}");

    broker.hang_publishes(false);
    stuck.await.unwrap().unwrap();
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn a_failed_publish_on_a_dead_channel_triggers_a_single_reconnection() {
    // Arrange
    let broker = FakeBroker::new();
    let pool = builder(&broker).build().await.unwrap();
    let before = pool.snapshot().await.unwrap().revision();

    // Act
    broker.drop_all_channels_silently();
    let outcome = pool.publish(event(1)).await;

    // Assert
    assert!(matches!(outcome, Err(PublisherError::Publish(_))));
    let pool = &pool;
    eventually(|| async move {
        pool.snapshot()
            .await
            .map_or(false, |snapshot| snapshot.revision() > before)
    })
    .await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connects(), 2);
    pool.publish(event(2)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn publishers_of_a_replaced_pool_do_not_trigger_another_reconnection() {
    // Arrange
    let broker = FakeBroker::new();
    let pool = Arc::new(builder(&broker).build().await.unwrap());
    let before = pool.snapshot().await.unwrap().revision();
    broker.hang_publishes(true);
    let stuck = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.publish(event(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The idle publisher notices the broken channel and the pool reconnects, while the
    // other one is still busy sending on the old connection.
    broker.break_all_channels();
    let reconnected = pool.clone();
    eventually(|| {
        let pool = reconnected.clone();
        async move {
            pool.snapshot()
                .await
                .map_or(false, |snapshot| snapshot.revision() > before)
        }
    })
    .await;

    // Act
    broker.hang_publishes(false);
    let outcome = stuck.await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Assert
    assert!(matches!(outcome, Err(PublisherError::Publish(_))));
    assert_eq!(broker.connects(), 2);
    assert_eq!(pool.size().await, 2);
    pool.publish(event(2)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_closed_pool_stops_publishing_and_reconnecting() {
    let broker = FakeBroker::new();
    let pool = builder(&broker).build().await.unwrap();

    pool.close().await;

    assert!(matches!(
        pool.publish(event(1)).await,
        Err(PublisherError::ConnectionClosed)
    ));
    assert_eq!(pool.size().await, 0);
    assert_eq!(broker.open_channels(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connects(), 1);
}

#[tokio::test]
async fn the_exchange_name_is_required() {
    let outcome = PublishersPool::<OrderEvent>::builder(FakeBroker::new())
        .build()
        .await;

    assert!(matches!(
        outcome,
        Err(BuildError::Config(ConfigError::MissingField("exchange_name")))
    ));
}

#[tokio::test]
async fn building_fails_if_the_broker_is_unreachable() {
    let broker = FakeBroker::new();
    broker.refuse_connections(true);

    let outcome = builder(&broker).build().await;

    assert!(matches!(outcome, Err(BuildError::Connect(_))));
}
