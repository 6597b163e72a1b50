/// The error type returned by message handlers.
///
/// A failed message is rejected and requeued; a failed batch is nacked and requeued as a
/// whole. The subscriber keeps consuming either way.
///
/// Any `anyhow::Error` converts into a `HandlerError`, so handlers can use `?` on
/// `anyhow::Result`s:
///
/// ```rust
/// use carrot_pools::consumers::{BrokerAction, HandlerError};
///
/// fn parse(payload: &[u8]) -> Result<BrokerAction, HandlerError> {
///     let _order: serde_json::Value = serde_json::from_slice(payload).map_err(anyhow::Error::from)?;
///     Ok(BrokerAction::Ack)
/// }
/// ```
#[derive(thiserror::Error, Debug)]
#[error("Handling of a message failed")]
pub struct HandlerError(#[from] anyhow::Error);

impl HandlerError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(error.into())
    }

    /// The error returned by the handler.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}
