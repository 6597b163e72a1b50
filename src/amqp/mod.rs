//! Helpers for connecting to a rabbitmq broker, and the traits the pools use to talk to it.

pub mod configuration;
mod delivery;
mod factory;
mod transport;

pub use delivery::{Acknowledger, Delivery};
pub use factory::{Channel, Connection, ConnectionFactory};
pub use transport::{
    BrokerChannel, BrokerConnection, DeliveryStream, HealthStatus, PublishConfirm, Transport,
};

pub use lapin::ExchangeKind;
