use crate::consumers::error::HandlerError;
use std::future::Future;

/// What the subscriber should tell the broker once a message (or a batch) has been handled.
///
/// It is ignored when the pool acknowledges messages automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerAction {
    /// Acknowledge: the broker forgets about the message.
    Ack,
    /// Send the message back to the queue, to be delivered again.
    Requeue,
}

/// Implementers of the `MessageHandler` trait process the messages consumed by a
/// [`SubscribersPool`](crate::consumers::SubscribersPool), one at a time.
///
/// # Scope
///
/// `handle` only sees the payload of the message.
/// The subscriber takes care of acking/rejecting the message with the broker according to the
/// outcome of processing: an `Err` (or a panic) is handled like [`BrokerAction::Requeue`].
///
/// # Implementors
///
/// Async closures taking the payload as a `Vec<u8>` can be used through [`ClosureHandler`].
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]) -> Result<BrokerAction, HandlerError>;
}

/// Implementers of the `BatchHandler` trait process the messages consumed by a
/// [`SubscribersPool`](crate::consumers::SubscribersPool) in batches.
///
/// The batch is acknowledged (or nacked) as a whole with a single broker operation.
#[async_trait::async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    async fn handle_batch(&self, payloads: &[Vec<u8>]) -> Result<BrokerAction, HandlerError>;
}

#[async_trait::async_trait]
impl<H> MessageHandler for Box<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, payload: &[u8]) -> Result<BrokerAction, HandlerError> {
        H::handle(self, payload).await
    }
}

#[async_trait::async_trait]
impl<H> BatchHandler for Box<H>
where
    H: BatchHandler + ?Sized,
{
    async fn handle_batch(&self, payloads: &[Vec<u8>]) -> Result<BrokerAction, HandlerError> {
        H::handle_batch(self, payloads).await
    }
}

/// Wrapper type to turn an async closure into a [`MessageHandler`].
///
/// The closure gets its own copy of the payload and can return any error convertible into a
/// [`HandlerError`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> MessageHandler for ClosureHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BrokerAction, E>> + Send,
    E: Into<HandlerError> + 'static,
{
    async fn handle(&self, payload: &[u8]) -> Result<BrokerAction, HandlerError> {
        (self.0)(payload.to_vec()).await.map_err(Into::into)
    }
}

/// Wrapper type to turn an async closure into a [`BatchHandler`].
pub struct ClosureBatchHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> BatchHandler for ClosureBatchHandler<F>
where
    F: Fn(Vec<Vec<u8>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BrokerAction, E>> + Send,
    E: Into<HandlerError> + 'static,
{
    async fn handle_batch(&self, payloads: &[Vec<u8>]) -> Result<BrokerAction, HandlerError> {
        (self.0)(payloads.to_vec()).await.map_err(Into::into)
    }
}
