use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::FutureExt;
use lapin::ExchangeKind;
use std::future::Future;

use super::Delivery;

/// `Transport` defines an interface for types that are capable of establishing a connection
/// with the message broker.
///
/// The pools only ever talk to the broker through `Transport`, [`BrokerConnection`] and
/// [`BrokerChannel`]: [`ConnectionFactory`](super::ConnectionFactory) implements them on top
/// of `lapin`, but any implementation with the same semantics can be plugged in.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a new connection to the broker.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A connection to the broker, multiplexing one or more [`BrokerChannel`]s.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a new channel on top of this connection.
    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// Close the connection, and every channel opened on top of it.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// The operations the pools need from a broker channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare a durable exchange.
    async fn declare_exchange(&self, exchange: &str, kind: &ExchangeKind)
        -> Result<(), anyhow::Error>;

    /// Declare a durable queue.
    async fn declare_queue(&self, queue: &str) -> Result<(), anyhow::Error>;

    /// Bind `queue` to `exchange` using `routing_key` as binding pattern.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    /// Limit the number of unacknowledged deliveries pushed to consumers on this channel.
    async fn set_prefetch_count(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    /// Put the channel in confirm mode.
    async fn enable_publisher_confirms(&self) -> Result<(), anyhow::Error>;

    /// Publish a persistent message.
    ///
    /// The returned [`PublishConfirm`] resolves once the broker has confirmed the message.
    /// It resolves straight away to `true` if the channel is not in confirm mode.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<PublishConfirm, anyhow::Error>;

    /// Start consuming from `queue`.
    ///
    /// The stream ends (or yields an error) when the channel is closed.
    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream, anyhow::Error>;

    /// Close the channel.
    async fn close(&self) -> Result<(), anyhow::Error>;

    /// A future that resolves when the channel is closed unexpectedly (e.g. the broker went
    /// away or a protocol error occurred).
    ///
    /// It never resolves if the channel is closed on purpose.
    fn closed(&self) -> BoxFuture<'static, anyhow::Error>;

    fn status(&self) -> HealthStatus;
}

/// Stream of messages pushed by the broker to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// The pending outcome of a publish operation: `true` if the broker acked the message,
/// `false` if it nacked it.
pub struct PublishConfirm(BoxFuture<'static, Result<bool, anyhow::Error>>);

impl PublishConfirm {
    pub fn new<F>(confirmation: F) -> Self
    where
        F: Future<Output = Result<bool, anyhow::Error>> + Send + 'static,
    {
        Self(confirmation.boxed())
    }

    /// A confirmation for channels that are not in confirm mode.
    pub fn not_requested() -> Self {
        Self::new(async { Ok(true) })
    }

    pub async fn wait(self) -> Result<bool, anyhow::Error> {
        self.0.await
    }
}

impl std::fmt::Debug for PublishConfirm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishConfirm").finish_non_exhaustive()
    }
}
