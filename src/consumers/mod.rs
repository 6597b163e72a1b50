//! Facilities to consume messages from a RabbitMq queue. Check out [`SubscribersPool`] as a
//! starting point.
pub use error::HandlerError;
pub use handler::{
    BatchHandler, BrokerAction, ClosureBatchHandler, ClosureHandler, MessageHandler,
};
pub use subscriber::{MultipleAckConfig, SubscribersPool, SubscribersPoolBuilder};

mod error;
mod handler;
mod subscriber;
mod supervisor;
mod worker;
