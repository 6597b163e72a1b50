use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::Revision;

/// Asks a connection supervisor to reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectSignal {
    /// Revision of the generation that observed the failure.
    pub revision: Revision,
}

/// Sending half of the reconnection path shared by all the workers of a pool.
///
/// The path holds at most one pending signal: when several workers fail at the same time,
/// the first signal is queued and the others are dropped.
#[derive(Clone, Debug)]
pub(crate) struct ReconnectNotifier(mpsc::Sender<ReconnectSignal>);

impl ReconnectNotifier {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<ReconnectSignal>) {
        let (sender, receiver) = mpsc::channel(1);
        (Self(sender), receiver)
    }

    /// Returns `true` if the signal was queued.
    pub(crate) fn notify(&self, revision: Revision) -> bool {
        match self.0.try_send(ReconnectSignal { revision }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(%revision, "A reconnection is already pending");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%revision, "The connection supervisor is gone");
                false
            }
        }
    }
}

/// Remembers the revision of the last successful connection, to tell stale signals apart.
#[derive(Debug)]
pub(crate) struct ReconnectGate {
    last_revision: Revision,
}

impl ReconnectGate {
    pub(crate) fn new(last_revision: Revision) -> Self {
        Self { last_revision }
    }

    pub(crate) fn last_revision(&self) -> Revision {
        self.last_revision
    }

    /// A signal raised by a generation older than the current one has already been served.
    pub(crate) fn is_stale(&self, signal: &ReconnectSignal) -> bool {
        signal.revision < self.last_revision
    }

    pub(crate) fn record(&mut self, revision: Revision) {
        self.last_revision = revision;
    }
}
