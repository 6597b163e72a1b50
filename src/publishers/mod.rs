//! Facilities to publish messages to a RabbitMq exchange. Check out [`PublishersPool`] as a
//! starting point.
mod message;
mod publisher;
mod supervisor;
mod worker;

pub use message::{json_encoder, raw_encoder, Confirmable, Encoder, OutgoingMessage, Routable};
pub use publisher::{
    PublisherError, PublishersPool, PublishersPoolBuilder, DEFAULT_PUBLISH_TIMEOUT,
};
pub use worker::Pool;
