mod batch;
mod single;

use crate::helpers::{eventually, random_name, FakeBroker, Topology};
use async_trait::async_trait;
use carrot_pools::consumers::{
    BrokerAction, HandlerError, MessageHandler, MultipleAckConfig, SubscribersPool,
    SubscribersPoolBuilder,
};
use carrot_pools::pool::{BuildError, ConfigError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Keeps track of the payloads it handled and acks them all.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    handled: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, payload: &[u8]) -> Result<BrokerAction, HandlerError> {
        self.handled
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).into_owned());
        Ok(BrokerAction::Ack)
    }
}

pub fn builder(broker: &FakeBroker) -> SubscribersPoolBuilder<FakeBroker> {
    SubscribersPool::builder(broker.clone())
        .exchange_name(random_name())
        .queue_name(random_name())
}

#[tokio::test(start_paused = true)]
async fn the_queue_is_bound_and_consumed_on_every_channel() {
    // Arrange
    let broker = FakeBroker::new();
    let (exchange, queue) = (random_name(), random_name());

    // Act
    let _pool = SubscribersPool::builder(broker.clone())
        .exchange_name(&exchange)
        .queue_name(&queue)
        .binding_keys(["orders.*", "refunds.#"])
        .prefetch_count(10)
        .channel_count(1)
        .message_handler(RecordingHandler::default())
        .build()
        .await
        .unwrap();

    // Assert
    assert_eq!(
        broker.topology(),
        vec![
            Topology::Exchange(exchange.clone()),
            Topology::Queue(queue.clone()),
            Topology::Binding {
                queue: queue.clone(),
                exchange: exchange.clone(),
                routing_key: "orders.*".into(),
            },
            Topology::Binding {
                queue: queue.clone(),
                exchange,
                routing_key: "refunds.#".into(),
            },
            Topology::Prefetch(10),
            Topology::Consume {
                queue,
                auto_ack: false,
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn queues_are_bound_to_everything_by_default() {
    let broker = FakeBroker::new();

    let pool = builder(&broker)
        .message_handler(RecordingHandler::default())
        .build()
        .await
        .unwrap();

    let bindings: Vec<_> = broker
        .topology()
        .into_iter()
        .filter_map(|operation| match operation {
            Topology::Binding { routing_key, .. } => Some(routing_key),
            _ => None,
        })
        .collect();
    assert_eq!(bindings, vec!["#", "#"]);
    assert_eq!(pool.size(), 2);
    assert!(!broker
        .topology()
        .iter()
        .any(|operation| matches!(operation, Topology::Prefetch(_))));
}

#[tokio::test(start_paused = true)]
async fn subscribers_come_back_after_the_connection_breaks() {
    // Arrange
    let broker = FakeBroker::new();
    let handler = RecordingHandler::default();
    let pool = builder(&broker)
        .message_handler(handler.clone())
        .build()
        .await
        .unwrap();
    let before = pool.revision().unwrap();

    // Act
    broker.break_all_channels();

    // Assert
    let pool = &pool;
    eventually(|| async move { pool.revision().map_or(false, |revision| revision > before) })
        .await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connects(), 2);
    assert_eq!(pool.size(), 2);

    broker.deliver("after reconnection");
    let handler = &handler;
    eventually(|| async move { handler.handled() == vec!["after reconnection"] }).await;
}

#[tokio::test(start_paused = true)]
async fn a_closed_pool_stops_consuming() {
    let broker = FakeBroker::new();
    let pool = builder(&broker)
        .message_handler(RecordingHandler::default())
        .build()
        .await
        .unwrap();

    pool.close().await;

    assert_eq!(pool.revision(), None);
    assert_eq!(pool.size(), 0);
    assert_eq!(broker.open_channels(), 0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connects(), 1);
}

#[tokio::test]
async fn exchange_and_queue_names_are_required() {
    let without_queue = SubscribersPool::builder(FakeBroker::new())
        .exchange_name(random_name())
        .message_handler(RecordingHandler::default())
        .build()
        .await;
    let without_exchange = SubscribersPool::builder(FakeBroker::new())
        .queue_name(random_name())
        .message_handler(RecordingHandler::default())
        .build()
        .await;

    assert!(matches!(
        without_queue,
        Err(BuildError::Config(ConfigError::MissingField("queue_name")))
    ));
    assert!(matches!(
        without_exchange,
        Err(BuildError::Config(ConfigError::MissingField("exchange_name")))
    ));
}

#[tokio::test]
async fn a_handler_is_required() {
    let broker = FakeBroker::new();

    let without_handler = builder(&broker).build().await;

    assert!(matches!(
        without_handler,
        Err(BuildError::Config(ConfigError::MissingHandler))
    ));
    assert_eq!(broker.connects(), 0);
}

#[tokio::test]
async fn auto_ack_needs_a_message_handler() {
    let broker = FakeBroker::new();

    let outcome = builder(&broker)
        .auto_ack(true)
        .batch_handler(
            batch::recording_handler(Default::default(), false),
            MultipleAckConfig::default(),
        )
        .build()
        .await;

    assert!(matches!(
        outcome,
        Err(BuildError::Config(ConfigError::MissingHandler))
    ));
}
