use lapin::ExchangeKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info_span, warn};

use crate::amqp::Transport;
use crate::consumers::supervisor::{Running, SubscriberSettings, Supervisor};
use crate::consumers::worker::Handling;
use crate::consumers::{BatchHandler, MessageHandler};
use crate::logging::Logger;
use crate::pool::{BuildError, ConfigError, Revision, DEFAULT_CHANNEL_COUNT};

const DEFAULT_MAX_COUNT: usize = 5;
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Acknowledge messages in batches rather than one by one.
///
/// A batch is handed over to the [`BatchHandler`] once it holds `max_count` messages, or when
/// no new message arrived within `timeout` of the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultipleAckConfig {
    /// Maximum number of messages in a batch. Values below 2 fall back to 5.
    pub max_count: usize,
    /// Maximum time to wait for the next message of a batch. Zero falls back to 1 second.
    pub timeout: Duration,
}

impl MultipleAckConfig {
    pub fn new(max_count: usize, timeout: Duration) -> Self {
        Self { max_count, timeout }
    }

    fn normalised(self) -> Self {
        Self {
            max_count: if self.max_count < 2 {
                DEFAULT_MAX_COUNT
            } else {
                self.max_count
            },
            timeout: if self.timeout.is_zero() {
                DEFAULT_BATCH_TIMEOUT
            } else {
                self.timeout
            },
        }
    }
}

impl Default for MultipleAckConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COUNT, DEFAULT_BATCH_TIMEOUT)
    }
}

/// A pool of subscribers consuming from the same queue over a single connection to RabbitMq.
///
/// Each subscriber owns one AMQP channel and hands the messages it receives over to the
/// configured handler, one by one or in batches (see [`MultipleAckConfig`]).
///
/// # Fault tolerance
///
/// When a subscriber's delivery stream ends the pool stops every subscriber, closes the
/// connection and reconnects in the background, every 2 seconds until it succeeds.
///
/// # Example
///
/// ```rust,no_run
/// use carrot_pools::amqp::configuration::RabbitMqSettings;
/// use carrot_pools::amqp::ConnectionFactory;
/// use carrot_pools::consumers::{BrokerAction, ClosureHandler, HandlerError, SubscribersPool};
///
/// # async fn run() -> Result<(), anyhow::Error> {
/// let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
/// let pool = SubscribersPool::builder(factory)
///     .exchange_name("orders")
///     .queue_name("orders.billing")
///     .message_handler(ClosureHandler(|payload: Vec<u8>| async move {
///         println!("{}", String::from_utf8_lossy(&payload));
///         Ok::<_, HandlerError>(BrokerAction::Ack)
///     }))
///     .build()
///     .await?;
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct SubscribersPool {
    running: watch::Receiver<Option<Running>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SubscribersPool {
    pub fn builder<T: Transport>(transport: T) -> SubscribersPoolBuilder<T> {
        SubscribersPoolBuilder::new(transport)
    }

    /// Revision of the subscribers currently consuming, `None` while reconnecting.
    pub fn revision(&self) -> Option<Revision> {
        (*self.running.borrow()).map(|running| running.revision)
    }

    /// Number of subscribers currently consuming, 0 while reconnecting.
    pub fn size(&self) -> usize {
        (*self.running.borrow()).map_or(0, |running| running.size)
    }

    /// Stop every subscriber and close the connection. The pool does not reconnect afterwards.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(error = ?e, "Subscribers pool supervisor crashed");
            }
        }
    }
}

/// A builder for [`SubscribersPool`].
///
/// Use [`SubscribersPool::builder`] as entrypoint.
pub struct SubscribersPoolBuilder<T> {
    transport: T,
    exchange_name: Option<String>,
    exchange_kind: ExchangeKind,
    queue_name: Option<String>,
    binding_keys: Vec<String>,
    auto_ack: bool,
    message_handler: Option<Arc<dyn MessageHandler>>,
    batch_handler: Option<(Arc<dyn BatchHandler>, MultipleAckConfig)>,
    channel_count: usize,
    prefetch_count: Option<u16>,
    logger: Option<Logger>,
}

impl<T: Transport> SubscribersPoolBuilder<T> {
    fn new(transport: T) -> Self {
        Self {
            transport,
            exchange_name: None,
            exchange_kind: ExchangeKind::Fanout,
            queue_name: None,
            binding_keys: Vec::new(),
            auto_ack: false,
            message_handler: None,
            batch_handler: None,
            channel_count: DEFAULT_CHANNEL_COUNT,
            prefetch_count: None,
            logger: None,
        }
    }

    /// Required.
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

    /// The durable queue to consume from. Required.
    #[must_use]
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Patterns used to bind the queue to the exchange. Defaults to `["#"]`.
    #[must_use]
    pub fn binding_keys<I, K>(mut self, binding_keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.binding_keys = binding_keys.into_iter().map(Into::into).collect();
        self
    }

    /// Let the broker consider messages acknowledged as soon as they are delivered.
    ///
    /// Batch handlers are not used in this mode: a [`MessageHandler`] is required.
    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Handle messages one at a time.
    #[must_use]
    pub fn message_handler(mut self, handler: impl MessageHandler) -> Self {
        self.message_handler = Some(Arc::new(handler));
        self
    }

    /// Handle messages in batches, acknowledging each batch with a single broker operation.
    ///
    /// It takes precedence over [`message_handler`](Self::message_handler) unless
    /// [`auto_ack`](Self::auto_ack) is enabled.
    #[must_use]
    pub fn batch_handler(mut self, handler: impl BatchHandler, config: MultipleAckConfig) -> Self {
        self.batch_handler = Some((Arc::new(handler), config));
        self
    }

    /// Number of subscribers, each on its own AMQP channel.
    /// Defaults to 2; 0 is treated as the default.
    #[must_use]
    pub fn channel_count(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count;
        self
    }

    /// Maximum number of unacknowledged messages the broker pushes to each subscriber.
    /// Unbounded if left unspecified.
    #[must_use]
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    /// The [`Logger`] every task of the pool reports to.
    /// Defaults to the dispatcher that is current when [`build`](Self::build) is called.
    #[must_use]
    pub fn with_logger(mut self, logger: impl Into<Logger>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    fn settings(self) -> Result<(T, SubscriberSettings, Option<Logger>), ConfigError> {
        let exchange_name = match self.exchange_name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(ConfigError::MissingField("exchange_name")),
        };
        let queue_name = match self.queue_name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(ConfigError::MissingField("queue_name")),
        };
        let handling = match (self.auto_ack, self.batch_handler, self.message_handler) {
            (false, Some((handler, config)), _) => Handling::Batch {
                handler,
                config: config.normalised(),
            },
            (auto_ack, _, Some(handler)) => Handling::Single { handler, auto_ack },
            (_, _, None) => return Err(ConfigError::MissingHandler),
        };
        let binding_keys = if self.binding_keys.is_empty() {
            vec!["#".to_string()]
        } else {
            self.binding_keys
        };
        let channel_count = match self.channel_count {
            0 => DEFAULT_CHANNEL_COUNT,
            n => n,
        };

        let settings = SubscriberSettings {
            exchange_name,
            exchange_kind: self.exchange_kind,
            queue_name,
            binding_keys,
            auto_ack: self.auto_ack,
            prefetch_count: self.prefetch_count,
            channel_count,
            handling,
        };
        Ok((self.transport, settings, self.logger))
    }

    /// Connect to the broker and start consuming.
    ///
    /// It fails if the configuration is invalid or if the first connection attempt fails.
    pub async fn build(self) -> Result<SubscribersPool, BuildError> {
        let (transport, settings, logger) = self.settings()?;
        let logger = logger.unwrap_or_else(Logger::current);
        let queue_name = settings.queue_name.clone();

        let (running_sender, running) = watch::channel(None);
        let (shutdown, shutdown_receiver) = watch::channel(false);
        let mut supervisor = Supervisor::new(
            transport,
            settings,
            running_sender,
            shutdown_receiver,
            logger.clone(),
        );
        logger
            .attach(supervisor.establish())
            .await
            .map_err(BuildError::Connect)?;

        let span = logger.span(|| info_span!("subscribers_supervisor", queue = %queue_name));
        let supervisor = logger.spawn(span, supervisor.run());

        Ok(SubscribersPool {
            running,
            shutdown,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }
}
