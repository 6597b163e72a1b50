use anyhow::Context;
use lapin::ExchangeKind;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Barrier};
use tracing::{debug, error, info, info_span};

use crate::amqp::{BrokerChannel, BrokerConnection, Transport};
use crate::logging::Logger;
use crate::pool::state::PoolWriter;
use crate::pool::{
    close_channel, close_connection, ReconnectGate, ReconnectNotifier, ReconnectSignal, Revision,
    RECONNECT_DELAY,
};
use crate::publishers::worker::{Pool, PublisherWorker, WorkerHandle};
use crate::publishers::{Encoder, OutgoingMessage};

type Channel<T> = <<T as Transport>::Connection as BrokerConnection>::Channel;
type Workers<M, T> = Vec<(WorkerHandle<M>, PublisherWorker<M, Channel<T>>)>;

/// Validated configuration of a publishers pool.
pub(crate) struct PublisherSettings<M> {
    pub(crate) exchange_name: Arc<str>,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) channel_count: usize,
    pub(crate) confirmation: bool,
    pub(crate) encoder: Encoder<M>,
}

/// Owns the broker connection behind a publishers pool and rebuilds the pool every time
/// one of its workers reports the connection as broken.
pub(crate) struct Supervisor<M, T: Transport> {
    transport: T,
    settings: PublisherSettings<M>,
    connection: Option<T::Connection>,
    gate: Option<ReconnectGate>,
    notifier: ReconnectNotifier,
    signals: mpsc::Receiver<ReconnectSignal>,
    writer: PoolWriter<Pool<M>>,
    shutdown: watch::Receiver<bool>,
    logger: Logger,
}

impl<M, T> Supervisor<M, T>
where
    M: OutgoingMessage,
    T: Transport,
{
    pub(crate) fn new(
        transport: T,
        settings: PublisherSettings<M>,
        writer: PoolWriter<Pool<M>>,
        shutdown: watch::Receiver<bool>,
        logger: Logger,
    ) -> Self {
        let (notifier, signals) = ReconnectNotifier::channel();
        Self {
            transport,
            settings,
            connection: None,
            gate: None,
            notifier,
            signals,
            writer,
            shutdown,
            logger,
        }
    }

    /// Connect, start a new generation of publishers and publish it once every publisher is
    /// running.
    pub(crate) async fn establish(&mut self) -> Result<(), anyhow::Error> {
        let (revision, workers) = self.connect().await?;

        let started = Arc::new(Barrier::new(workers.len() + 1));
        let mut handles = Vec::with_capacity(workers.len());
        for (index, (handle, worker)) in workers.into_iter().enumerate() {
            let span = self.logger.span(|| {
                info_span!(
                    "publisher",
                    exchange = %self.settings.exchange_name,
                    %revision,
                    channel = index
                )
            });
            self.logger.spawn(span, worker.run(started.clone()));
            handles.push(handle);
        }
        started.wait().await;

        info!(%revision, publishers = handles.len(), "Publishers pool started");
        self.writer
            .replace(Some(Arc::new(Pool::new(revision, handles))))
            .await;
        Ok(())
    }

    /// Open a connection and one publisher per AMQP channel.
    ///
    /// Nothing is left open if any step fails.
    #[tracing::instrument(name = "publishers_connect", skip(self))]
    async fn connect(&mut self) -> Result<(Revision, Workers<M, T>), anyhow::Error> {
        let connection = self
            .transport
            .connect()
            .await
            .context("Failed to connect to RabbitMQ")?;
        let channels = match self.open_channels(&connection).await {
            Ok(channels) => channels,
            Err(e) => {
                close_connection(&connection).await;
                return Err(e);
            }
        };

        let revision = Revision::next();
        let workers = channels
            .into_iter()
            .map(|channel| {
                PublisherWorker::new(
                    channel,
                    revision,
                    self.settings.exchange_name.clone(),
                    self.settings.encoder.clone(),
                    self.settings.confirmation,
                    self.notifier.clone(),
                )
            })
            .collect();

        self.connection = Some(connection);
        match self.gate.as_mut() {
            Some(gate) => gate.record(revision),
            None => self.gate = Some(ReconnectGate::new(revision)),
        }
        Ok((revision, workers))
    }

    async fn open_channels(
        &self,
        connection: &T::Connection,
    ) -> Result<Vec<Channel<T>>, anyhow::Error> {
        let mut channels = Vec::with_capacity(self.settings.channel_count);
        for _ in 0..self.settings.channel_count {
            let outcome = match connection.create_channel().await {
                Ok(channel) => {
                    let outcome = self.set_up(&channel).await;
                    channels.push(channel);
                    outcome
                }
                Err(e) => Err(e.context("Failed to open an AMQP channel")),
            };
            if let Err(e) = outcome {
                for channel in &channels {
                    close_channel(channel).await;
                }
                return Err(e);
            }
        }
        Ok(channels)
    }

    async fn set_up(&self, channel: &Channel<T>) -> Result<(), anyhow::Error> {
        channel
            .declare_exchange(&self.settings.exchange_name, &self.settings.exchange_kind)
            .await
            .context("Failed to declare exchange")?;
        if self.settings.confirmation {
            channel
                .enable_publisher_confirms()
                .await
                .context("Failed to enable publisher confirms")?;
        }
        Ok(())
    }

    /// Serve reconnection signals until the pool is closed.
    pub(crate) async fn run(mut self) {
        loop {
            let signal = tokio::select! {
                signal = self.signals.recv() => signal,
                _ = self.shutdown.changed() => None,
            };
            let Some(signal) = signal else { break };

            if let Some(gate) = &self.gate {
                if gate.is_stale(&signal) {
                    debug!(
                        signal = %signal.revision,
                        last_revision = %gate.last_revision(),
                        "Ignoring stale reconnection signal"
                    );
                    continue;
                }
            }

            info!(revision = %signal.revision, "Reconnecting publishers pool");
            self.close_connection().await;
            self.writer.replace(None).await;
            if !self.reconnect().await {
                break;
            }
        }

        self.close_connection().await;
        self.writer.replace(None).await;
        info!("Publishers pool closed");
    }

    /// Retry until connected. Returns `false` if the pool was closed in the meantime.
    async fn reconnect(&mut self) -> bool {
        let mut shutdown = self.shutdown.clone();
        loop {
            let attempt = tokio::select! {
                attempt = self.establish() => attempt,
                _ = shutdown.changed() => return false,
            };
            match attempt {
                Ok(()) => return true,
                Err(e) => {
                    error!(error = ?e, "Failed to reconnect, retrying in {:?}", RECONNECT_DELAY);
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
            }
        }
    }

    async fn close_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            close_connection(&connection).await;
        }
    }
}
