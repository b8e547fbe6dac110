//! Caller-facing error codes.

use serde::{Deserialize, Serialize};

/// Structured code attached to every error a synchronous caller can see.
///
/// Both services map their internal errors onto this set so that callers
/// branch on the code, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    FailedPrecondition,
    ResourceExhausted,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Validation and precondition failures are final. Only internal
    /// failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Internal)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_internal_is_retryable() {
        assert!(ErrorCode::Internal.is_retryable());
        assert!(!ErrorCode::ResourceExhausted.is_retryable());
        assert!(!ErrorCode::FailedPrecondition.is_retryable());
        assert!(!ErrorCode::InvalidArgument.is_retryable());
    }

    #[test]
    fn test_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::PermissionDenied).unwrap();
        assert_eq!(json, "\"PERMISSION_DENIED\"");
        assert_eq!(ErrorCode::PermissionDenied.to_string(), "PERMISSION_DENIED");
    }
}
