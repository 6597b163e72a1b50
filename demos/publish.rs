use carrot_pools::amqp::{configuration::RabbitMqSettings, ConnectionFactory, ExchangeKind};
use carrot_pools::publishers::{Confirmable, OutgoingMessage, PublishersPool, Routable};
use serde::Serialize;

#[derive(Serialize)]
struct Greeting {
    text: String,
    language: String,
}

// Greetings are routed by language: consumers can bind to `greetings.en`, `greetings.*`, etc.
impl Routable for Greeting {
    fn routing_key(&self) -> String {
        format!("greetings.{}", self.language)
    }
}

impl Confirmable for Greeting {
    fn confirm(&self, confirmed: bool) {
        println!("The broker confirmed {:?}: {}", self.text, confirmed);
    }
}

impl OutgoingMessage for Greeting {
    fn routable(&self) -> Option<&dyn Routable> {
        Some(self)
    }

    fn confirmable(&self) -> Option<&dyn Confirmable> {
        Some(self)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();
    let connection_factory = ConnectionFactory::new_from_config(&settings)?;

    // A single connection, with 4 publishers on top of it - one per AMQP channel.
    // If the connection breaks, the pool reconnects in the background: in the meantime
    // `publish` fails fast with `PublisherError::ConnectionClosed`.
    let pool = PublishersPool::builder(connection_factory)
        .exchange_name("greetings")
        .exchange_kind(ExchangeKind::Topic)
        .channel_count(4)
        .with_publisher_confirmation()
        .publish_timeout(std::time::Duration::from_secs(3))
        .build()
        .await?;

    for (text, language) in [("Hello world!", "en"), ("Ciao mondo!", "it")] {
        pool.publish(Greeting {
            text: text.into(),
            language: language.into(),
        })
        .await?;
    }

    // Give confirmations a chance to come back before shutting down.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    pool.close().await;

    Ok(())
}
