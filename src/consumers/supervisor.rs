use anyhow::Context;
use lapin::ExchangeKind;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Barrier};
use tracing::{debug, error, info, info_span};

use crate::amqp::{BrokerChannel, BrokerConnection, DeliveryStream, Transport};
use crate::consumers::worker::{Handling, SubscriberWorker, WorkerHandle};
use crate::logging::Logger;
use crate::pool::{
    close_channel, close_connection, ReconnectGate, ReconnectNotifier, ReconnectSignal, Revision,
    RECONNECT_DELAY,
};

type Channel<T> = <<T as Transport>::Connection as BrokerConnection>::Channel;

/// Validated configuration of a subscribers pool.
pub(crate) struct SubscriberSettings {
    pub(crate) exchange_name: String,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) queue_name: String,
    pub(crate) binding_keys: Vec<String>,
    pub(crate) auto_ack: bool,
    pub(crate) prefetch_count: Option<u16>,
    pub(crate) channel_count: usize,
    pub(crate) handling: Handling,
}

/// The generation of subscribers currently consuming.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Running {
    pub(crate) revision: Revision,
    pub(crate) size: usize,
}

pub(crate) struct Supervisor<T: Transport> {
    transport: T,
    settings: SubscriberSettings,
    connection: Option<T::Connection>,
    workers: Vec<WorkerHandle>,
    gate: Option<ReconnectGate>,
    notifier: ReconnectNotifier,
    signals: mpsc::Receiver<ReconnectSignal>,
    running: watch::Sender<Option<Running>>,
    shutdown: watch::Receiver<bool>,
    logger: Logger,
}

impl<T: Transport> Supervisor<T> {
    pub(crate) fn new(
        transport: T,
        settings: SubscriberSettings,
        running: watch::Sender<Option<Running>>,
        shutdown: watch::Receiver<bool>,
        logger: Logger,
    ) -> Self {
        let (notifier, signals) = ReconnectNotifier::channel();
        Self {
            transport,
            settings,
            connection: None,
            workers: Vec::new(),
            gate: None,
            notifier,
            signals,
            running,
            shutdown,
            logger,
        }
    }

    /// Connect and start one subscriber per AMQP channel.
    pub(crate) async fn establish(&mut self) -> Result<(), anyhow::Error> {
        let (revision, channels) = self.connect().await?;

        let started = Arc::new(Barrier::new(channels.len() + 1));
        for (index, (channel, deliveries)) in channels.into_iter().enumerate() {
            let (handle, worker) = SubscriberWorker::new(
                channel,
                deliveries,
                self.settings.handling.clone(),
                revision,
                self.notifier.clone(),
            );
            let span = self.logger.span(|| {
                info_span!(
                    "subscriber",
                    queue = %self.settings.queue_name,
                    %revision,
                    channel = index
                )
            });
            self.logger.spawn(span, worker.run(started.clone()));
            self.workers.push(handle);
        }
        started.wait().await;

        let size = self.workers.len();
        info!(%revision, subscribers = size, "Subscribers pool started");
        self.running.send_replace(Some(Running { revision, size }));
        Ok(())
    }

    #[tracing::instrument(name = "subscribers_connect", skip(self))]
    async fn connect(
        &mut self,
    ) -> Result<(Revision, Vec<(Channel<T>, DeliveryStream)>), anyhow::Error> {
        let connection = self
            .transport
            .connect()
            .await
            .context("Failed to connect to RabbitMQ")?;

        let mut channels = Vec::with_capacity(self.settings.channel_count);
        for _ in 0..self.settings.channel_count {
            let outcome = match connection.create_channel().await {
                Ok(channel) => match self.start_consuming(&channel).await {
                    Ok(deliveries) => {
                        channels.push((channel, deliveries));
                        Ok(())
                    }
                    Err(e) => {
                        close_channel(&channel).await;
                        Err(e)
                    }
                },
                Err(e) => Err(e.context("Failed to open an AMQP channel")),
            };
            if let Err(e) = outcome {
                for (channel, _deliveries) in channels {
                    close_channel(&channel).await;
                }
                close_connection(&connection).await;
                return Err(e);
            }
        }

        let revision = Revision::next();
        self.connection = Some(connection);
        match self.gate.as_mut() {
            Some(gate) => gate.record(revision),
            None => self.gate = Some(ReconnectGate::new(revision)),
        }
        Ok((revision, channels))
    }

    /// Set up the queue topology on `channel` and start consuming from it.
    async fn start_consuming(&self, channel: &Channel<T>) -> Result<DeliveryStream, anyhow::Error> {
        let settings = &self.settings;
        channel
            .declare_exchange(&settings.exchange_name, &settings.exchange_kind)
            .await
            .context("Failed to declare exchange")?;
        channel
            .declare_queue(&settings.queue_name)
            .await
            .context("Failed to declare queue")?;
        for binding_key in &settings.binding_keys {
            debug!(
                queue = %settings.queue_name,
                exchange = %settings.exchange_name,
                binding_key,
                "Binding queue"
            );
            channel
                .bind_queue(&settings.queue_name, &settings.exchange_name, binding_key)
                .await
                .with_context(|| format!("Failed to bind queue with {binding_key}"))?;
        }
        if let Some(prefetch_count) = settings.prefetch_count {
            channel
                .set_prefetch_count(prefetch_count)
                .await
                .context("Failed to set the prefetch count")?;
        }
        channel
            .consume(&settings.queue_name, settings.auto_ack)
            .await
            .context("Failed to start consuming")
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

            info!(revision = %signal.revision, "Reconnecting subscribers pool");
            self.tear_down().await;
            if !self.reconnect().await {
                break;
            }
        }

        self.tear_down().await;
        info!("Subscribers pool closed");
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

    /// Stop every subscriber, then close the connection.
    async fn tear_down(&mut self) {
        for worker in self.workers.drain(..) {
            worker.stop();
        }
        if let Some(connection) = self.connection.take() {
            close_connection(&connection).await;
        }
        self.running.send_replace(None);
    }
}
