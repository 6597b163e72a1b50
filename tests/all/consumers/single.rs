use crate::consumers::{builder, RecordingHandler};
use crate::helpers::{eventually, FakeBroker, Settlement, Topology};
use async_trait::async_trait;
use carrot_pools::consumers::{BrokerAction, HandlerError, MessageHandler};
use std::time::Duration;

/// Decides the outcome from the payload.
struct ScriptedHandler;

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, payload: &[u8]) -> Result<BrokerAction, HandlerError> {
        match payload {
            b"ack" => Ok(BrokerAction::Ack),
            b"requeue" => Ok(BrokerAction::Requeue),
            b"panic" => panic!("The handler blew up"),
            _ => Err(anyhow::anyhow!("Cannot handle this message").into()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn every_message_is_settled_according_to_its_outcome() {
    // Arrange
    let broker = FakeBroker::new();
    let _pool = builder(&broker)
        .channel_count(1)
        .message_handler(ScriptedHandler)
        .build()
        .await
        .unwrap();

    // Act
    let acked = broker.deliver("ack");
    let requeued = broker.deliver("requeue");
    let failed = broker.deliver("garbage");
    let panicked = broker.deliver("panic");
    let after_panic = broker.deliver("ack");

    // Assert
    let observer = &broker;
    eventually(|| async move { observer.settlements().len() == 5 }).await;
    assert_eq!(
        broker.settlements(),
        vec![
            Settlement::Ack {
                tag: acked,
                multiple: false
            },
            Settlement::Reject {
                tag: requeued,
                requeue: true
            },
            Settlement::Reject {
                tag: failed,
                requeue: true
            },
            Settlement::Reject {
                tag: panicked,
                requeue: true
            },
            Settlement::Ack {
                tag: after_panic,
                multiple: false
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn auto_acked_messages_are_never_settled_by_the_subscriber() {
    let broker = FakeBroker::new();
    let handler = RecordingHandler::default();
    let _pool = builder(&broker)
        .channel_count(1)
        .auto_ack(true)
        .message_handler(handler.clone())
        .build()
        .await
        .unwrap();

    broker.deliver("first");
    broker.deliver("second");

    let observer = &handler;
    eventually(|| async move { observer.handled().len() == 2 }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.handled(), vec!["first", "second"]);
    assert!(broker.settlements().is_empty());
    assert!(broker
        .topology()
        .iter()
        .any(|operation| matches!(operation, Topology::Consume { auto_ack: true, .. })));
}
