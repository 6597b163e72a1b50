use crate::consumers::builder;
use crate::helpers::{eventually, FakeBroker, Settlement};
use carrot_pools::consumers::{
    BatchHandler, BrokerAction, ClosureBatchHandler, HandlerError, MultipleAckConfig,
    SubscribersPool,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Batches = Arc<Mutex<Vec<Vec<Vec<u8>>>>>;

pub fn recording_handler(batches: Batches, fail: bool) -> impl BatchHandler {
    ClosureBatchHandler(move |payloads: Vec<Vec<u8>>| {
        let batches = batches.clone();
        async move {
            batches.lock().unwrap().push(payloads);
            if fail {
                Err(HandlerError::from(anyhow::anyhow!("Downstream unavailable")))
            } else {
                Ok(BrokerAction::Ack)
            }
        }
    })
}

fn batch_sizes(batches: &Batches) -> Vec<usize> {
    batches.lock().unwrap().iter().map(Vec::len).collect()
}

async fn batching_pool(broker: &FakeBroker, batches: &Batches, fail: bool) -> SubscribersPool {
    builder(broker)
        .channel_count(1)
        .batch_handler(
            recording_handler(batches.clone(), fail),
            MultipleAckConfig::new(5, Duration::from_millis(1000)),
        )
        .build()
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn a_quiet_queue_flushes_the_pending_batch() {
    // Arrange
    let broker = FakeBroker::new();
    let batches = Batches::default();
    let _pool = batching_pool(&broker, &batches, false).await;

    // Act
    broker.deliver("one");
    broker.deliver("two");
    let last = broker.deliver("three");
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Assert
    assert_eq!(
        *batches.lock().unwrap(),
        vec![vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]]
    );
    assert_eq!(
        broker.settlements(),
        vec![Settlement::Ack {
            tag: last,
            multiple: true
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn batches_never_exceed_the_maximum_size() {
    // Arrange
    let broker = FakeBroker::new();
    let batches = Batches::default();
    let _pool = batching_pool(&broker, &batches, false).await;

    // Act
    let tags: Vec<u64> = (0..7).map(|i| broker.deliver(format!("message {i}"))).collect();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Assert
    assert_eq!(batch_sizes(&batches), vec![5, 2]);
    assert_eq!(
        broker.settlements(),
        vec![
            Settlement::Ack {
                tag: tags[4],
                multiple: true
            },
            Settlement::Ack {
                tag: tags[6],
                multiple: true
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn a_failed_batch_is_requeued_as_a_whole() {
    let broker = FakeBroker::new();
    let batches = Batches::default();
    let _pool = batching_pool(&broker, &batches, true).await;

    broker.deliver("one");
    broker.deliver("two");
    let last = broker.deliver("three");
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(batch_sizes(&batches), vec![3]);
    assert_eq!(
        broker.settlements(),
        vec![Settlement::Nack {
            tag: last,
            multiple: true,
            requeue: true
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn an_unfinished_batch_is_dropped_when_the_channel_breaks() {
    let broker = FakeBroker::new();
    let batches = Batches::default();
    let _pool = batching_pool(&broker, &batches, false).await;

    broker.deliver("one");
    broker.deliver("two");
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.break_all_channels();

    let observer = &broker;
    eventually(|| async move { observer.connects() == 2 && observer.open_channels() == 1 }).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(batches.lock().unwrap().is_empty());
    assert!(broker.settlements().is_empty());
}
