use carrot_pools::amqp::{configuration::RabbitMqSettings, ConnectionFactory, ExchangeKind};
use carrot_pools::consumers::{
    BrokerAction, ClosureBatchHandler, HandlerError, MultipleAckConfig, SubscribersPool,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = RabbitMqSettings::default();
    let connection_factory = ConnectionFactory::new_from_config(&settings)?;

    // Messages are acked in batches of up to 10, or whatever arrived before a 500ms pause.
    // A failing batch is nacked and requeued as a whole.
    let pool = SubscribersPool::builder(connection_factory)
        .exchange_name("greetings")
        .exchange_kind(ExchangeKind::Topic)
        .queue_name("greetings.printer")
        .binding_keys(["greetings.*"])
        .prefetch_count(50)
        .batch_handler(
            ClosureBatchHandler(|payloads: Vec<Vec<u8>>| async move {
                for payload in &payloads {
                    println!("{}", String::from_utf8_lossy(payload));
                }
                Ok::<_, HandlerError>(BrokerAction::Ack)
            }),
            MultipleAckConfig::new(10, Duration::from_millis(500)),
        )
        .build()
        .await?;

    println!("Consuming with revision {:?}", pool.revision());
    tokio::signal::ctrl_c().await?;
    pool.close().await;

    Ok(())
}
