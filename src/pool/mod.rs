//! Building blocks shared by [`PublishersPool`](crate::publishers::PublishersPool) and
//! [`SubscribersPool`](crate::consumers::SubscribersPool).
//!
//! Both pools keep one broker connection and `channel_count` workers on top of it, one per
//! AMQP channel. All the workers built on top of the same connection belong to the same
//! generation and share its [`Revision`].
//!
//! When a worker notices that its channel is gone it raises a [`ReconnectSignal`] carrying its
//! revision. The path has room for a single pending signal, so a burst of failing workers
//! triggers a single reconnection; signals raised by a generation older than the last
//! connected one are discarded by the supervisor.
//!
//! While reconnecting, the supervisor retries every 2 seconds until it succeeds.

mod error;
mod reconnect;
mod revision;
pub(crate) mod state;

use std::time::Duration;
use tracing::warn;

use crate::amqp::{BrokerChannel, BrokerConnection};

pub use error::{BuildError, ConfigError};
pub use reconnect::ReconnectSignal;
pub(crate) use reconnect::{ReconnectGate, ReconnectNotifier};
pub use revision::Revision;

/// Number of AMQP channels opened on each connection, unless configured otherwise.
pub const DEFAULT_CHANNEL_COUNT: usize = 2;

/// Delay between two failed connection attempts.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub(crate) async fn close_connection(connection: &impl BrokerConnection) {
    if let Err(e) = connection.close().await {
        warn!(error = ?e, "Failed to close RabbitMQ connection");
    }
}

pub(crate) async fn close_channel(channel: &impl BrokerChannel) {
    if let Err(e) = channel.close().await {
        warn!(error = ?e, "Failed to close AMQP channel");
    }
}
