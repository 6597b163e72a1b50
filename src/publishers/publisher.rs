use lapin::ExchangeKind;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info_span, warn};

use crate::amqp::Transport;
use crate::logging::Logger;
use crate::pool::state::{pool_state, PoolReader};
use crate::pool::{BuildError, ConfigError, DEFAULT_CHANNEL_COUNT};
use crate::publishers::supervisor::{PublisherSettings, Supervisor};
use crate::publishers::worker::{Job, Pool};
use crate::publishers::{json_encoder, Encoder, OutgoingMessage};

/// Timeout applied to [`PublishersPool::publish`] unless configured otherwise.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `publish` waits before scanning the publishers again when they are all busy.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// A pool of publishers sharing a single connection to RabbitMq.
///
/// Every publisher owns one AMQP channel. A message is handed over to the first publisher
/// that is free to take it; if they are all busy `publish` keeps trying until the publish
/// timeout expires.
///
/// # Fault tolerance
///
/// When the connection (or one of its channels) breaks, the pool tears the connection down
/// and reconnects in the background, every 2 seconds until it succeeds. In the meantime
/// `publish` fails straight away with [`PublisherError::ConnectionClosed`].
///
/// # How do I build a `PublishersPool`?
///
/// `PublishersPool` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`PublishersPool::builder`].
///
/// # Example
///
/// ```rust,no_run
/// use carrot_pools::amqp::configuration::RabbitMqSettings;
/// use carrot_pools::amqp::{ConnectionFactory, ExchangeKind};
/// use carrot_pools::publishers::PublishersPool;
///
/// # async fn run() -> Result<(), anyhow::Error> {
/// let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
/// let pool = PublishersPool::<serde_json::Value>::builder(factory)
///     .exchange_name("orders")
///     .exchange_kind(ExchangeKind::Topic)
///     .publish_timeout(std::time::Duration::from_secs(3))
///     .build()
///     .await?;
///
/// pool.publish(serde_json::json!({ "order_id": 42 })).await?;
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct PublishersPool<M> {
    reader: PoolReader<Pool<M>>,
    timeout: Duration,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    exchange_name: Arc<str>,
    logger: Logger,
}

impl<M: OutgoingMessage> PublishersPool<M> {
    /// Start building a [`PublishersPool`] whose messages are serialised as JSON.
    pub fn builder<T: Transport>(transport: T) -> PublishersPoolBuilder<M, T>
    where
        M: Serialize,
    {
        PublishersPoolBuilder::new(transport, json_encoder())
    }

    /// Start building a [`PublishersPool`] turning messages into bytes with `encoder`.
    pub fn builder_with_encoder<T: Transport>(
        transport: T,
        encoder: Encoder<M>,
    ) -> PublishersPoolBuilder<M, T> {
        PublishersPoolBuilder::new(transport, encoder)
    }

    /// Publish a message to the pool's exchange.
    ///
    /// It returns once a publisher has sent the message to the broker, or failed to.
    /// Publishers only accept a message while idle: the publish timeout bounds the time spent
    /// waiting for one of them, after which `publish` waits for the outcome of the send.
    ///
    /// Broker confirmations (if enabled) are not awaited: they are delivered to the message
    /// through [`Confirmable`](super::Confirmable).
    pub async fn publish(&self, message: M) -> Result<(), PublisherError> {
        self.logger.attach(self.hand_off(message)).await
    }

    async fn hand_off(&self, message: M) -> Result<(), PublisherError> {
        let pool = match self.reader.current().await {
            Some(pool) if !pool.is_empty() => pool,
            _ => {
                debug!(exchange = %self.exchange_name, "No publisher available");
                return Err(PublisherError::ConnectionClosed);
            }
        };

        let deadline = Instant::now() + self.timeout;
        let (reply, outcome) = oneshot::channel();
        let mut job = Job::new(message, reply);
        loop {
            for worker in pool.workers() {
                match worker.try_hand_off(job) {
                    Ok(()) => {
                        // The worker answers every message it accepted, unless it crashed.
                        return outcome
                            .await
                            .unwrap_or(Err(PublisherError::ConnectionClosed));
                    }
                    Err(rejected) => job = rejected,
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    exchange = %self.exchange_name,
                    timeout = ?self.timeout,
                    "Every publisher stayed busy until the publish timeout"
                );
                return Err(PublisherError::Timeout);
            }
            tokio::time::sleep(SCAN_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Number of publishers in the current pool, 0 while disconnected.
    pub async fn size(&self) -> usize {
        self.reader.current().await.map_or(0, |pool| pool.len())
    }

    /// The current generation of publishers, `None` while disconnected.
    pub async fn snapshot(&self) -> Option<Arc<Pool<M>>> {
        self.reader.current().await
    }

    /// Stop reconnecting, close every publisher and the connection.
    ///
    /// Calls to `publish` fail with [`PublisherError::ConnectionClosed`] afterwards.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(error = ?e, "Publishers pool supervisor crashed");
            }
        }
    }
}

/// Error returned when trying to publish a message using [`PublishersPool`].
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("There is no open connection with the RabbitMq broker")]
    ConnectionClosed,
    #[error("The timeout threshold was reached before a publisher could take the message")]
    Timeout,
    #[error("Failed to encode the message")]
    Encode(#[source] anyhow::Error),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Publish(#[source] anyhow::Error),
}

impl PublisherError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PublisherError::Timeout)
    }
}

/// A builder for [`PublishersPool`].
///
/// Use [`PublishersPool::builder`] as entrypoint.
pub struct PublishersPoolBuilder<M, T> {
    transport: T,
    exchange_name: Option<String>,
    exchange_kind: ExchangeKind,
    channel_count: usize,
    confirmation: bool,
    encoder: Encoder<M>,
    publish_timeout: Duration,
    logger: Option<Logger>,
}

impl<M, T> PublishersPoolBuilder<M, T>
where
    M: OutgoingMessage,
    T: Transport,
{
    fn new(transport: T, encoder: Encoder<M>) -> Self {
        Self {
            transport,
            exchange_name: None,
            exchange_kind: ExchangeKind::Fanout,
            channel_count: DEFAULT_CHANNEL_COUNT,
            confirmation: false,
            encoder,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            logger: None,
        }
    }

    /// The exchange messages are published to. Required.
    #[must_use]
    pub fn exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange_name.into());
        self
    }

    /// Defaults to [`ExchangeKind::Fanout`].
    #[must_use]
    pub fn exchange_kind(mut self, exchange_kind: ExchangeKind) -> Self {
        self.exchange_kind = exchange_kind;
        self
    }

    /// Number of publishers, each on its own AMQP channel.
    /// Defaults to 2; 0 is treated as the default.
    #[must_use]
    pub fn channel_count(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count;
        self
    }

    /// Put every channel in confirm mode and report the broker's confirmations to messages
    /// implementing [`Confirmable`](super::Confirmable).
    #[must_use]
    pub fn with_publisher_confirmation(self) -> Self {
        self.confirmation(true)
    }

    #[must_use]
    pub fn confirmation(mut self, confirmation: bool) -> Self {
        self.confirmation = confirmation;
        self
    }

    #[must_use]
    pub fn encoder(mut self, encoder: Encoder<M>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Maximum time spent waiting for a free publisher.
    /// Defaults to 5 seconds; a zero timeout is treated as the default.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// The [`Logger`] every task of the pool reports to.
    /// Defaults to the dispatcher that is current when [`build`](Self::build) is called.
    #[must_use]
    pub fn with_logger(mut self, logger: impl Into<Logger>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    /// Connect to the broker and start the publishers.
    ///
    /// It fails if the configuration is invalid or if the first connection attempt fails:
    /// the pool only reconnects in the background once it has been connected.
    pub async fn build(self) -> Result<PublishersPool<M>, BuildError> {
        let exchange_name: Arc<str> = match self.exchange_name {
            Some(name) if !name.is_empty() => name.into(),
            _ => return Err(ConfigError::MissingField("exchange_name").into()),
        };
        let channel_count = match self.channel_count {
            0 => DEFAULT_CHANNEL_COUNT,
            n => n,
        };
        let timeout = if self.publish_timeout.is_zero() {
            DEFAULT_PUBLISH_TIMEOUT
        } else {
            self.publish_timeout
        };
        let logger = self.logger.unwrap_or_else(Logger::current);

        let (holder, reader, writer) = pool_state(None);
        let span = logger.span(|| info_span!("publishers_pool", exchange = %exchange_name));
        logger.spawn(span, holder.run());

        let (shutdown, shutdown_receiver) = watch::channel(false);
        let settings = PublisherSettings {
            exchange_name: exchange_name.clone(),
            exchange_kind: self.exchange_kind,
            channel_count,
            confirmation: self.confirmation,
            encoder: self.encoder,
        };
        let mut supervisor = Supervisor::new(
            self.transport,
            settings,
            writer,
            shutdown_receiver,
            logger.clone(),
        );
        logger
            .attach(supervisor.establish())
            .await
            .map_err(BuildError::Connect)?;

        let span = logger.span(|| info_span!("publishers_supervisor", exchange = %exchange_name));
        let supervisor = logger.spawn(span, supervisor.run());

        Ok(PublishersPool {
            reader,
            timeout,
            shutdown,
            supervisor: Mutex::new(Some(supervisor)),
            exchange_name,
            logger,
        })
    }
}
