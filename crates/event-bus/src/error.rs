use thiserror::Error;

/// Errors raised by the bus itself.
#[derive(Debug, Error)]
pub enum BusError {
    /// The envelope is missing a required identifier.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The envelope could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No queue with this name was declared.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// The queue already has a subscriber.
    #[error("Queue already subscribed: {0}")]
    AlreadySubscribed(String),

    /// The broker could not accept the message.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Every publish attempt failed.
    #[error("Publish failed after {attempts} attempts: {reason}")]
    PublishFailed { attempts: u32, reason: String },
}

/// Failure reported by a consumer for one delivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumerError {
    /// Worth redelivering; a dependency was briefly unavailable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Will never succeed; goes straight to the dead-letter queue.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
