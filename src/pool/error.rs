/// A pool was configured with missing or invalid values.
///
/// The pool never starts if its configuration is rejected.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0} should be specified")]
    MissingField(&'static str),
    #[error("A message handler should be specified")]
    MissingHandler,
    #[error("Invalid TLS configuration")]
    Tls(#[source] anyhow::Error),
}

/// Error returned when building a publishers or subscribers pool.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to establish the initial connection with the RabbitMq broker")]
    Connect(#[source] anyhow::Error),
}
