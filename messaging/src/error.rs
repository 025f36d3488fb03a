//! Error types for the messaging library.

use messaging_topics::RegistryError;
use thiserror::Error;

/// Result type alias for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur during messaging operations.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// A required option is missing or an option has an invalid value.
    #[error("configuration error: {0}")]
    Config(String),

    /// The broker client could not be created or could not subscribe.
    #[error("connection error: {0}")]
    Connection(String),

    /// The payload type has no usable topic binding.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Error serializing a payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error deserializing a payload.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Steady-state broker failure (poll, enqueue, delivery, flush).
    #[error("transport error: {0}")]
    Transport(String),

    /// Committing consumption progress failed.
    #[error("commit error: {0}")]
    Commit(String),

    /// `open` was called on an instance that is already open.
    #[error("already open")]
    AlreadyOpen,

    /// The envelope was not produced by a consumer and cannot be acknowledged.
    #[error("message cannot be acknowledged")]
    NotAckable,

    /// The configured driver is not available.
    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),

    /// Error reading the configuration document.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing the configuration document.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A background task failed to shut down cleanly.
    #[error("shutdown error: {0}")]
    Shutdown(String),

    /// Error from the underlying rdkafka library.
    #[cfg(feature = "kafka")]
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = MessagingError::Config("brokers must be set in options".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: brokers must be set in options"
        );
    }

    #[test]
    fn test_registry_error_is_transparent() {
        let err = MessagingError::from(RegistryError::Unregistered("demo::Payload"));
        assert_eq!(err.to_string(), "type demo::Payload has no registered topic");
    }
}
