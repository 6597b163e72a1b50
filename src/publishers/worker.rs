use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Barrier, Semaphore};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, warn, Instrument};

use crate::amqp::{BrokerChannel, HealthStatus, PublishConfirm};
use crate::pool::state::Generation;
use crate::pool::{close_channel, ReconnectNotifier, Revision};
use crate::publishers::{Encoder, OutgoingMessage, PublisherError};

/// A message waiting to be picked up by a worker, with the path to send the outcome back to
/// the caller.
pub(crate) struct Job<M> {
    message: M,
    reply: oneshot::Sender<Result<(), PublisherError>>,
}

impl<M> Job<M> {
    pub(crate) fn new(message: M, reply: oneshot::Sender<Result<(), PublisherError>>) -> Self {
        Self { message, reply }
    }

    fn reply(self, outcome: Result<(), PublisherError>) {
        // The caller always waits for the outcome of an accepted message, unless its task
        // was cancelled.
        let _ = self.reply.send(outcome);
    }
}

/// A generation of publishers, all sharing the same connection and revision.
///
/// A `Pool` never changes once published: every reconnection builds a new one.
pub struct Pool<M> {
    revision: Revision,
    workers: Vec<WorkerHandle<M>>,
}

impl<M> Pool<M> {
    pub(crate) fn new(revision: Revision, workers: Vec<WorkerHandle<M>>) -> Self {
        Self { revision, workers }
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Number of publishers, one per AMQP channel.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// The revision reported by each publisher, in scan order.
    pub fn worker_revisions(&self) -> Vec<Revision> {
        self.workers.iter().map(|worker| worker.revision).collect()
    }

    pub(crate) fn workers(&self) -> &[WorkerHandle<M>] {
        &self.workers
    }
}

impl<M: Send + 'static> Generation for Pool<M> {
    fn revision(&self) -> Revision {
        self.revision
    }

    fn close(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

/// The caller-side half of a [`PublisherWorker`].
pub(crate) struct WorkerHandle<M> {
    revision: Revision,
    ready: Arc<Semaphore>,
    jobs: mpsc::Sender<Job<M>>,
    stop: mpsc::Sender<()>,
}

impl<M> WorkerHandle<M> {
    /// Give `job` to the worker if it is idle, hand it back otherwise.
    ///
    /// The worker holds at most one readiness permit, released only while it waits for work:
    /// a worker busy publishing (or waiting for a confirmation) never accepts a message.
    pub(crate) fn try_hand_off(&self, job: Job<M>) -> Result<(), Job<M>> {
        match self.ready.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(job),
        }
        self.jobs.try_send(job).map_err(|e| e.into_inner())
    }

    fn stop(&self) {
        // A full buffer means a stop is already pending.
        let _ = self.stop.try_send(());
    }
}

/// Owns one AMQP channel and publishes the messages handed over by the pool, one at a time.
pub(crate) struct PublisherWorker<M, C> {
    channel: C,
    revision: Revision,
    exchange_name: Arc<str>,
    encoder: Encoder<M>,
    confirmation: bool,
    ready: Arc<Semaphore>,
    jobs: mpsc::Receiver<Job<M>>,
    stop: mpsc::Receiver<()>,
    reconnect: ReconnectNotifier,
}

impl<M, C> PublisherWorker<M, C>
where
    M: OutgoingMessage,
    C: BrokerChannel,
{
    pub(crate) fn new(
        channel: C,
        revision: Revision,
        exchange_name: Arc<str>,
        encoder: Encoder<M>,
        confirmation: bool,
        reconnect: ReconnectNotifier,
    ) -> (WorkerHandle<M>, Self) {
        // The pool is published only once its workers run, so a new worker starts out idle.
        let ready = Arc::new(Semaphore::new(1));
        let (job_sender, jobs) = mpsc::channel(1);
        let (stop_sender, stop) = mpsc::channel(1);
        let handle = WorkerHandle {
            revision,
            ready: ready.clone(),
            jobs: job_sender,
            stop: stop_sender,
        };
        let worker = Self {
            channel,
            revision,
            exchange_name,
            encoder,
            confirmation,
            ready,
            jobs,
            stop,
            reconnect,
        };
        (handle, worker)
    }

    pub(crate) async fn run(mut self, started: Arc<Barrier>) {
        // The supervisor may give up on this generation before it is complete.
        tokio::select! {
            _ = started.wait() => {}
            _ = self.stop.recv() => {
                close_channel(&self.channel).await;
                debug!("Publisher stopped before starting");
                return;
            }
        }
        let closed = self.channel.closed();
        tokio::pin!(closed);

        loop {
            // Idle again: accept the next message.
            if self.ready.available_permits() == 0 {
                self.ready.add_permits(1);
            }
            tokio::select! {
                biased;

                e = &mut closed => {
                    error!(error = ?e, "AMQP channel closed unexpectedly, requesting a reconnection");
                    self.reconnect.notify(self.revision);
                    break;
                }

                // Either an explicit stop, or every handle is gone.
                _ = self.stop.recv() => {
                    close_channel(&self.channel).await;
                    break;
                }

                job = self.jobs.recv() => match job {
                    Some(job) => self.publish(job).await,
                    None => {
                        close_channel(&self.channel).await;
                        break;
                    }
                }
            }
        }

        self.reject_pending();
        debug!("Publisher stopped");
    }

    async fn publish(&self, job: Job<M>) {
        let payload = match (self.encoder)(&job.message) {
            Ok(payload) => payload,
            Err(e) => {
                job.reply(Err(PublisherError::Encode(e)));
                return;
            }
        };
        let routing_key = job
            .message
            .routable()
            .map(|routable| routable.routing_key())
            .unwrap_or_default();

        match self
            .channel
            .publish(&self.exchange_name, &routing_key, &payload)
            .await
        {
            Ok(confirm) => {
                let Job { message, reply } = job;
                let _ = reply.send(Ok(()));
                if self.confirmation {
                    self.dispatch_confirmation(message, confirm).await;
                }
            }
            Err(e) => {
                let unhealthy = self.channel.status() == HealthStatus::Unhealthy;
                job.reply(Err(PublisherError::Publish(e)));
                if unhealthy {
                    warn!("Publishing failed on a closed AMQP channel, requesting a reconnection");
                    self.reconnect.notify(self.revision);
                }
            }
        }
    }

    /// Wait for the broker to confirm the message, then hand the outcome over to the message
    /// on a separate task.
    ///
    /// The caller has already been answered at this point: the callback is the only place
    /// where the confirmation is visible.
    async fn dispatch_confirmation(&self, message: M, confirm: PublishConfirm) {
        debug!("Waiting for confirmation");
        let confirmed = match confirm.wait().await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(error = ?e, "Publisher confirmation never arrived");
                false
            }
        };

        if message.confirmable().is_none() {
            debug!(confirmed, "Discarding confirmation");
            return;
        }
        tokio::spawn(
            async move {
                if let Some(confirmable) = message.confirmable() {
                    confirmable.confirm(confirmed);
                }
            }
            .in_current_span()
            .with_current_subscriber(),
        );
    }

    /// Every message accepted by this worker gets an answer, even if it will never be published.
    fn reject_pending(&mut self) {
        self.ready.close();
        self.jobs.close();
        while let Ok(job) = self.jobs.try_recv() {
            job.reply(Err(PublisherError::ConnectionClosed));
        }
    }
}
