use thiserror::Error;

use crate::MessageId;

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker did not accept the request. Callers treat this as transient.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// A message was built without a required field.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// End-transaction referenced a half message the broker no longer holds.
    #[error("Unknown half message: {0}")]
    UnknownHalfMessage(MessageId),

    /// Two subscriptions were opened for the same topic and consumer group.
    #[error("Consumer group {group} is already subscribed to {topic}")]
    DuplicateSubscription { topic: String, group: String },
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
