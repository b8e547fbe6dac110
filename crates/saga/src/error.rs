//! Platform error types.

use broker::BrokerError;
use outbox::StoreError;
use thiserror::Error;

/// Errors raised while wiring or pumping the services.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// `settle` kept finding work after its round limit.
    #[error("saga did not settle after {rounds} rounds")]
    Unsettled { rounds: usize },
}

/// Convenience type alias for platform results.
pub type Result<T> = std::result::Result<T, PlatformError>;
