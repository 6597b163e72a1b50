use serde::Serialize;
use std::sync::Arc;

/// A message that can be published through a [`PublishersPool`](super::PublishersPool).
///
/// Messages can opt into two optional capabilities, queried for every single message:
/// - [`Routable`], to choose the routing key the message is published with. Messages that
///   are not routable are published with an empty routing key.
/// - [`Confirmable`], to get notified when the broker confirms (or rejects) the message.
///   It only fires for pools with publisher confirmation enabled.
///
/// Both accessors default to `None`: override them to return `Some(self)` when the type
/// implements the corresponding capability.
///
/// ```rust
/// use carrot_pools::publishers::{OutgoingMessage, Routable};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct OrderCreated {
///     order_id: u64,
/// }
///
/// impl Routable for OrderCreated {
///     fn routing_key(&self) -> String {
///         "orders.created".into()
///     }
/// }
///
/// impl OutgoingMessage for OrderCreated {
///     fn routable(&self) -> Option<&dyn Routable> {
///         Some(self)
///     }
/// }
/// ```
pub trait OutgoingMessage: Send + Sync + 'static {
    fn routable(&self) -> Option<&dyn Routable> {
        None
    }

    fn confirmable(&self) -> Option<&dyn Confirmable> {
        None
    }
}

/// A message that knows which routing key it should be published with.
pub trait Routable {
    fn routing_key(&self) -> String;
}

/// A message that wants to know if the broker accepted it.
pub trait Confirmable: Send + Sync {
    /// Invoked on a dedicated task once the broker has confirmed the message.
    ///
    /// `confirmed` is `false` if the broker nacked the message or if the confirmation
    /// never arrived.
    fn confirm(&self, confirmed: bool);
}

/// Raw payloads are published as they are when using [`raw_encoder`].
impl OutgoingMessage for Vec<u8> {}

impl OutgoingMessage for String {}

impl OutgoingMessage for serde_json::Value {}

/// Turns a message into the bytes sent to the broker.
pub type Encoder<M> = Arc<dyn Fn(&M) -> Result<Vec<u8>, anyhow::Error> + Send + Sync>;

/// The default encoder, serialising messages as JSON.
pub fn json_encoder<M: Serialize>() -> Encoder<M> {
    Arc::new(|message: &M| serde_json::to_vec(message).map_err(anyhow::Error::from))
}

/// An encoder for messages that are already bytes.
pub fn raw_encoder<M: AsRef<[u8]>>() -> Encoder<M> {
    Arc::new(|message: &M| Ok(message.as_ref().to_vec()))
}
