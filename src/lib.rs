//! `carrot-pools` keeps pools of RabbitMQ publishers and subscribers alive across connection
//! failures, built on top of [`lapin`].
//!
//! Each pool owns a single broker connection and one worker per AMQP channel on top of it.
//! When the connection breaks, the pool tears it down and reconnects in the background.
//!
//! [`PublishersPool`](crate::publishers::PublishersPool) and
//! [`SubscribersPool`](crate::consumers::SubscribersPool) are the best starting points to
//! learn more about what `carrot-pools` provides and how to leverage it.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action against a local broker.

pub mod amqp;
pub mod consumers;
pub mod logging;
pub mod pool;
pub mod publishers;

pub use logging::Logger;
