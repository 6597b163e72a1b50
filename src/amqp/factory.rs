use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::transport::{
    BrokerChannel, BrokerConnection, DeliveryStream, HealthStatus, PublishConfirm, Transport,
};
use crate::amqp::Delivery;
use crate::pool::ConfigError;
use amq_protocol_types::FieldTable;
use anyhow::Context;
use futures_util::future::{pending, BoxFuture};
use futures_util::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    BasicProperties, ConnectionProperties, ExchangeKind,
};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

// AMQP reply code for a regular, operator-initiated close.
const REPLY_SUCCESS: u16 = 200;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let server_domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.host.clone());

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }

                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMQ.")?;
                Ok(Tls {
                    domain_name: server_domain_name,
                    connector,
                })
            })
            .transpose()
            .map_err(ConfigError::Tls)?;
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings.connection_timeout(),
            tls: tls.map(Arc::new),
        })
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = match tokio::time::timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        {
            Ok(result) => result.context("Failed to connect to RabbitMQ.")?,
            Err(_) => anyhow::bail!("Timed out while trying to connect to RabbitMQ."),
        };
        // Register a callback to log connection errors.
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        Ok(Connection(connection))
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake, expecting the configured domain on the
                    // server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection, anyhow::Error> {
        self.new_connection().await
    }
}

/// A connection to a RabbitMq broker.
pub struct Connection(lapin::Connection);

#[async_trait::async_trait]
impl BrokerConnection for Connection {
    type Channel = Channel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<Channel, anyhow::Error> {
        let channel = self.0.create_channel().await?;
        Ok(Channel::new(channel))
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if self.0.status().connected() {
            self.0.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

/// A RabbitMq channel, with a hook to get notified when the broker closes it.
pub struct Channel {
    inner: lapin::Channel,
    closed: Mutex<Option<oneshot::Receiver<lapin::Error>>>,
}

impl Channel {
    fn new(inner: lapin::Channel) -> Self {
        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        inner.on_error(move |e| {
            if let Some(sender) = sender.take() {
                let _ = sender.send(e);
            }
        });
        Self {
            inner,
            closed: Mutex::new(Some(receiver)),
        }
    }

    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }
}

#[async_trait::async_trait]
impl BrokerChannel for Channel {
    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self))]
    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
    ) -> Result<(), anyhow::Error> {
        let options = ExchangeDeclareOptions {
            passive: false,
            // The exchange will survive RabbitMq server restarts
            durable: true,
            auto_delete: false,
            internal: false,
            nowait: false,
        };
        self.inner
            .exchange_declare(exchange, kind.clone(), options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self))]
    async fn declare_queue(&self, queue: &str) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        };
        self.inner
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let options = QueueBindOptions { nowait: false };
        self.inner
            .queue_bind(queue, exchange, routing_key, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn set_prefetch_count(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn enable_publisher_confirms(&self) -> Result<(), anyhow::Error> {
        // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
        self.inner
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, payload))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<PublishConfirm, anyhow::Error> {
        // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
        // Setting `true` will cause a not-supported error
        let options = BasicPublishOptions {
            mandatory: false,
            immediate: false,
        };
        // Delivery mode: Non-persistent (1) or persistent (2).
        let properties = BasicProperties::default().with_delivery_mode(2);
        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?;
        Ok(PublishConfirm::new(async move {
            match confirm.await? {
                Confirmation::Nack(_) => Ok(false),
                Confirmation::Ack(_) | Confirmation::NotRequested => Ok(true),
            }
        }))
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self))]
    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream, anyhow::Error> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &Uuid::new_v4().to_string(),
                options,
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, anyhow::Error> {
        let receiver = self.closed.lock().ok().and_then(|mut guard| guard.take());
        async move {
            match receiver {
                Some(receiver) => match receiver.await {
                    Ok(e) => anyhow::Error::from(e).context("RabbitMQ channel was closed"),
                    // The channel was dropped without failing.
                    Err(_) => pending().await,
                },
                None => pending().await,
            }
        }
        .boxed()
    }

    fn status(&self) -> HealthStatus {
        if self.inner.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}
