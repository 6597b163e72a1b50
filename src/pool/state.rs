//! The single owner of "what is the current pool".
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::Revision;

const PENDING_REQUESTS: usize = 16;

/// A set of workers built on top of the same broker connection.
pub(crate) trait Generation: Send + Sync + 'static {
    fn revision(&self) -> Revision;

    /// Ask every worker of the generation to stop.
    fn close(&self);
}

type Request<P> = oneshot::Sender<Option<Arc<P>>>;
type Replacement<P> = (Option<Arc<P>>, oneshot::Sender<()>);

/// Actor owning the current generation.
///
/// Readers get the current value through a request/response exchange ([`PoolReader`]),
/// the connection supervisor replaces it through [`PoolWriter`].
/// No lock is shared between the two sides.
pub(crate) struct PoolStateHolder<P> {
    current: Option<Arc<P>>,
    requests: mpsc::Receiver<Request<P>>,
    replacements: mpsc::Receiver<Replacement<P>>,
}

/// Cheap handle used by callers to fetch the current generation.
pub(crate) struct PoolReader<P>(mpsc::Sender<Request<P>>);

impl<P> Clone for PoolReader<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Handle used by the connection supervisor to install a new generation, or none.
pub(crate) struct PoolWriter<P>(mpsc::Sender<Replacement<P>>);

pub(crate) fn pool_state<P: Generation>(
    initial: Option<Arc<P>>,
) -> (PoolStateHolder<P>, PoolReader<P>, PoolWriter<P>) {
    let (request_sender, requests) = mpsc::channel(PENDING_REQUESTS);
    let (replacement_sender, replacements) = mpsc::channel(1);
    let holder = PoolStateHolder {
        current: initial,
        requests,
        replacements,
    };
    (
        holder,
        PoolReader(request_sender),
        PoolWriter(replacement_sender),
    )
}

impl<P: Generation> PoolStateHolder<P> {
    /// Serve the current generation until every reader is gone.
    pub(crate) async fn run(mut self) {
        let mut writer_gone = false;
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(reply) => {
                        // The caller may have given up waiting.
                        let _ = reply.send(self.current.clone());
                    }
                    None => break,
                },
                replacement = self.replacements.recv(), if !writer_gone => match replacement {
                    Some((replacement, installed)) => {
                        self.install(replacement);
                        let _ = installed.send(());
                    }
                    None => writer_gone = true,
                },
            }
        }

        if let Some(current) = self.current.take() {
            debug!(revision = %current.revision(), "Closing pool on shutdown");
            current.close();
        }
    }

    fn install(&mut self, replacement: Option<Arc<P>>) {
        if let Some(outgoing) = self.current.take() {
            debug!(revision = %outgoing.revision(), "Closing outgoing pool");
            outgoing.close();
        }
        match &replacement {
            Some(incoming) => debug!(revision = %incoming.revision(), "Installed new pool"),
            None => debug!("Cleared pool"),
        }
        self.current = replacement;
    }
}

impl<P> PoolReader<P> {
    /// The current generation, `None` if disconnected or if the holder is gone.
    pub(crate) async fn current(&self) -> Option<Arc<P>> {
        let (reply, response) = oneshot::channel();
        self.0.send(reply).await.ok()?;
        response.await.ok().flatten()
    }
}

impl<P> PoolWriter<P> {
    /// Returns once the replacement is visible to readers.
    pub(crate) async fn replace(&self, replacement: Option<Arc<P>>) {
        let (installed, done) = oneshot::channel();
        if self.0.send((replacement, installed)).await.is_err() {
            debug!("Pool state holder is gone, dropping replacement");
            return;
        }
        let _ = done.await;
    }
}
