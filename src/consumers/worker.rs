use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Barrier};
use tracing::{debug, error, warn};

use crate::amqp::{BrokerChannel, Delivery, DeliveryStream};
use crate::consumers::{
    BatchHandler, BrokerAction, HandlerError, MessageHandler, MultipleAckConfig,
};
use crate::pool::{close_channel, ReconnectNotifier, Revision};

/// How deliveries are handed over to the application.
#[derive(Clone)]
pub(crate) enum Handling {
    Single {
        handler: Arc<dyn MessageHandler>,
        auto_ack: bool,
    },
    Batch {
        handler: Arc<dyn BatchHandler>,
        config: MultipleAckConfig,
    },
}

/// The supervisor-side half of a [`SubscriberWorker`].
pub(crate) struct WorkerHandle {
    stop: mpsc::Sender<()>,
}

impl WorkerHandle {
    pub(crate) fn stop(&self) {
        // A full buffer means a stop is already pending.
        let _ = self.stop.try_send(());
    }
}

enum Event {
    Delivery(Delivery),
    Stop,
    Closed(Option<anyhow::Error>),
}

/// Why a subscriber left its loop.
enum Exit {
    Stopped,
    Closed(Option<anyhow::Error>),
}

/// Consumes the deliveries pushed by the broker on one AMQP channel.
pub(crate) struct SubscriberWorker<C> {
    channel: C,
    deliveries: DeliveryStream,
    handling: Handling,
    revision: Revision,
    stop: mpsc::Receiver<()>,
    reconnect: ReconnectNotifier,
}

impl<C: BrokerChannel> SubscriberWorker<C> {
    pub(crate) fn new(
        channel: C,
        deliveries: DeliveryStream,
        handling: Handling,
        revision: Revision,
        reconnect: ReconnectNotifier,
    ) -> (WorkerHandle, Self) {
        let (stop_sender, stop) = mpsc::channel(1);
        let worker = Self {
            channel,
            deliveries,
            handling,
            revision,
            stop,
            reconnect,
        };
        (WorkerHandle { stop: stop_sender }, worker)
    }

    pub(crate) async fn run(mut self, started: Arc<Barrier>) {
        // The supervisor may give up on this generation before it is complete.
        tokio::select! {
            _ = started.wait() => {}
            _ = self.stop.recv() => {
                close_channel(&self.channel).await;
                debug!("Subscriber stopped before starting");
                return;
            }
        }

        let exit = match self.handling.clone() {
            Handling::Single { handler, auto_ack } => {
                self.consume_one_by_one(handler.as_ref(), auto_ack).await
            }
            Handling::Batch { handler, config } => {
                self.consume_in_batches(handler.as_ref(), config).await
            }
        };

        match exit {
            Exit::Stopped => {
                close_channel(&self.channel).await;
                debug!("Subscriber stopped");
            }
            Exit::Closed(e) => {
                error!(error = ?e, "Delivery stream closed, requesting a reconnection");
                self.reconnect.notify(self.revision);
            }
        }
    }

    async fn next_event(&mut self) -> Event {
        tokio::select! {
            biased;

            // Either an explicit stop, or the supervisor is gone.
            _ = self.stop.recv() => Event::Stop,

            delivery = self.deliveries.next() => match delivery {
                Some(Ok(delivery)) => Event::Delivery(delivery),
                Some(Err(e)) => Event::Closed(Some(e)),
                None => Event::Closed(None),
            }
        }
    }

    async fn consume_one_by_one(&mut self, handler: &dyn MessageHandler, auto_ack: bool) -> Exit {
        loop {
            let delivery = match self.next_event().await {
                Event::Delivery(delivery) => delivery,
                Event::Stop => return Exit::Stopped,
                Event::Closed(e) => return Exit::Closed(e),
            };
            let delivery_tag = delivery.delivery_tag;
            debug!(delivery_tag, "Handling message");

            let outcome = catch_panic(handler.handle(&delivery.data)).await;
            if let Err(e) = &outcome {
                error!(error = ?e, delivery_tag, "Failed to handle message");
            }
            if auto_ack {
                continue;
            }

            let acker = delivery.acker();
            let settled = match outcome {
                Ok(BrokerAction::Ack) => acker.ack(false).await,
                Ok(BrokerAction::Requeue) | Err(_) => acker.reject(true).await,
            };
            if let Err(e) = settled {
                warn!(error = ?e, delivery_tag, "Failed to settle message with the broker");
            }
        }
    }

    /// Wait for a first delivery, then keep accumulating until the batch is full or no new
    /// delivery arrived within `config.timeout`.
    ///
    /// Deliveries of an unfinished batch are left unacknowledged: the broker requeues them
    /// once the channel is gone.
    async fn consume_in_batches(
        &mut self,
        handler: &dyn BatchHandler,
        config: MultipleAckConfig,
    ) -> Exit {
        let mut payloads = Vec::with_capacity(config.max_count);
        loop {
            let mut last = match self.next_event().await {
                Event::Delivery(delivery) => delivery,
                Event::Stop => return Exit::Stopped,
                Event::Closed(e) => return Exit::Closed(e),
            };
            payloads.push(std::mem::take(&mut last.data));

            while payloads.len() < config.max_count {
                match tokio::time::timeout(config.timeout, self.next_event()).await {
                    Err(_) => break,
                    Ok(Event::Delivery(mut delivery)) => {
                        payloads.push(std::mem::take(&mut delivery.data));
                        last = delivery;
                    }
                    Ok(Event::Stop) => return Exit::Stopped,
                    Ok(Event::Closed(e)) => return Exit::Closed(e),
                }
            }

            let delivery_tag = last.delivery_tag;
            debug!(delivery_tag, batch_size = payloads.len(), "Handling batch");
            let outcome = catch_panic(handler.handle_batch(&payloads)).await;

            let acker = last.acker();
            let settled = match outcome {
                Ok(BrokerAction::Ack) => acker.ack(true).await,
                Ok(BrokerAction::Requeue) => acker.nack(true, true).await,
                Err(e) => {
                    error!(error = ?e, delivery_tag, "Failed to handle batch");
                    acker.nack(true, true).await
                }
            };
            if let Err(e) = settled {
                warn!(error = ?e, delivery_tag, "Failed to settle batch with the broker");
            }
            payloads.clear();
        }
    }
}

/// A panicking handler fails the message, it does not take the subscriber down.
async fn catch_panic<F>(handling: F) -> Result<BrokerAction, HandlerError>
where
    F: Future<Output = Result<BrokerAction, HandlerError>>,
{
    match AssertUnwindSafe(handling).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            Err(anyhow::anyhow!("Handler panicked: {}", panic_message(&*panic)).into())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown cause"
    }
}
