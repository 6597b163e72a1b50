//! The structured logger handed to every task spawned by a pool.
use std::future::Future;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::{dispatcher, Dispatch, Instrument, Span};

/// A [`tracing`] dispatcher owned by a pool.
///
/// Pools do not rely on the dispatcher that happens to be current when one of their tasks
/// runs: every supervisor, pool state holder and worker is spawned under the `Logger` the
/// pool was built with.
/// If none is provided, the pool captures the dispatcher that is current when it is built.
#[derive(Clone, Debug)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    pub fn new(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// The dispatcher that is current for the calling thread.
    pub fn current() -> Self {
        Self::new(dispatcher::get_default(Dispatch::clone))
    }

    /// Create a span that reports to this logger.
    pub(crate) fn span(&self, make_span: impl FnOnce() -> Span) -> Span {
        dispatcher::with_default(&self.dispatch, make_span)
    }

    /// Make `future` report to this logger, wherever it is polled.
    pub(crate) fn attach<F: Future>(&self, future: F) -> WithDispatch<F> {
        future.with_subscriber(self.dispatch.clone())
    }

    /// Spawn `future` on the current runtime, inside `span` and reporting to this logger.
    pub(crate) fn spawn<F>(&self, span: Span, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(
            future
                .instrument(span)
                .with_subscriber(self.dispatch.clone()),
        )
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::current()
    }
}

impl From<Dispatch> for Logger {
    fn from(dispatch: Dispatch) -> Self {
        Self::new(dispatch)
    }
}
