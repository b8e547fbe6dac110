use broker::BrokerError;
use common::ErrorCode;
use outbox::StoreError;
use thiserror::Error;

use crate::client::ClientError;
use crate::state::OrderStatus;

/// Errors surfaced by the order service.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("{0}")]
    InvalidArgument(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("order already rated")]
    AlreadyRated,

    #[error("{0}")]
    PermissionDenied(&'static str),

    /// The order is not in a status the action accepts.
    #[error("cannot {action} order in {current_state} status")]
    InvalidStateTransition {
        current_state: OrderStatus,
        action: &'static str,
    },

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    ResourceExhausted(String),

    /// The user service refused a call; its code is passed through.
    #[error("{0}")]
    Remote(ClientError),

    #[error("operation failed, please try again later")]
    Store(#[from] StoreError),

    #[error("operation failed, please try again later")]
    Broker(#[from] BrokerError),

    /// An invariant between the order table and the broker did not hold.
    #[error("operation failed, please try again later")]
    Internal(&'static str),
}

impl OrderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrderError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            OrderError::NotFound(_) => ErrorCode::NotFound,
            OrderError::AlreadyRated => ErrorCode::AlreadyExists,
            OrderError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            OrderError::InvalidStateTransition { .. } | OrderError::FailedPrecondition(_) => {
                ErrorCode::FailedPrecondition
            }
            OrderError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            OrderError::Remote(e) => e.code,
            OrderError::Store(_) | OrderError::Broker(_) | OrderError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn transition(current_state: OrderStatus, action: &'static str) -> Self {
        OrderError::InvalidStateTransition { current_state, action }
    }
}

/// Result type for order operations.
pub type Result<T> = std::result::Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_message() {
        let err = OrderError::transition(OrderStatus::Completed, "cancel");
        assert_eq!(err.to_string(), "cannot cancel order in COMPLETED status");
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[test]
    fn test_remote_code_passes_through() {
        let err = OrderError::Remote(ClientError::new(ErrorCode::ResourceExhausted, "insufficient balance"));
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert_eq!(err.to_string(), "insufficient balance");
    }

    #[test]
    fn test_infrastructure_errors_are_scrubbed() {
        let err = OrderError::from(BrokerError::Unavailable("connection refused".into()));
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.to_string(), "operation failed, please try again later");
    }
}
