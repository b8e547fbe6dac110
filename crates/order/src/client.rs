//! Synchronous calls into the user service.

use async_trait::async_trait;
use common::{ErrorCode, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by the user service, already mapped to a caller-facing code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ClientError {
    pub code: ErrorCode,
    pub message: String,
}

impl ClientError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionInfo {
    pub user_id: UserId,
    pub price_per_hour: i64,
    /// 0 offline, 1 online, 2 busy.
    pub status: i16,
}

/// The user-service operations the order service depends on.
#[async_trait]
pub trait UserClient: Send + Sync {
    async fn get_companion(&self, user_id: UserId) -> Result<CompanionInfo, ClientError>;

    /// Current balance; `NotFound` when the user has no wallet.
    async fn get_balance(&self, user_id: UserId) -> Result<i64, ClientError>;

    /// Debits `amount` once per `biz_order_id`.
    async fn consume(&self, user_id: UserId, amount: i64, biz_order_id: &str, remark: &str) -> Result<(), ClientError>;

    async fn update_companion_status(&self, user_id: UserId, status: i16) -> Result<(), ClientError>;

    async fn update_companion_stats(&self, user_id: UserId, rating: f64, delta_orders: i64) -> Result<(), ClientError>;
}
