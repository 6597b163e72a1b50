use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use std::sync::Arc;

/// Settles a delivery with the broker.
///
/// AMQP requires a delivery to be settled at most once; with `multiple` set, every
/// outstanding delivery up to and including this one is settled by the same operation.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self, multiple: bool) -> Result<(), anyhow::Error>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), anyhow::Error>;

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error>;
}

/// A message pushed by the broker to one of our consumers.
pub struct Delivery {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,

    // Kept private: settling the delivery is the worker's job, never the handler's.
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: DeliveryTag,
        routing_key: ShortString,
        redelivered: bool,
        data: Vec<u8>,
        acker: impl Acknowledger,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key,
            redelivered,
            data,
            acker: Arc::new(acker),
        }
    }

    pub(crate) fn acker(&self) -> &dyn Acknowledger {
        self.acker.as_ref()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("data", &self.data.len())
            .finish()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self::new(
            value.delivery_tag,
            value.routing_key,
            value.redelivered,
            value.data,
            value.acker,
        )
    }
}

#[async_trait::async_trait]
impl Acknowledger for lapin::acker::Acker {
    async fn ack(&self, multiple: bool) -> Result<(), anyhow::Error> {
        lapin::acker::Acker::ack(self, BasicAckOptions { multiple }).await?;
        Ok(())
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), anyhow::Error> {
        lapin::acker::Acker::nack(self, BasicNackOptions { multiple, requeue }).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
        lapin::acker::Acker::reject(self, BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
