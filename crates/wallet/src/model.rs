use chrono::{DateTime, Utc};
use common::UserId;
use outbox::StoreError;
use serde::{Deserialize, Serialize};

/// Ledger entry type. Together with `biz_order_id` it forms the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Debit, e.g. paying for an order.
    Consume,
    /// Credit, e.g. a top-up or a companion's earnings.
    Recharge,
    /// Credit returning a previous debit.
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Consume => "CONSUME",
            TransactionKind::Recharge => "RECHARGE",
            TransactionKind::Refund => "REFUND",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "CONSUME" => Ok(TransactionKind::Consume),
            "RECHARGE" => Ok(TransactionKind::Recharge),
            "REFUND" => Ok(TransactionKind::Refund),
            other => Err(StoreError::Corrupt(format!("unknown transaction type {other}"))),
        }
    }

    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionKind::Consume)
    }

    /// Signed balance delta for a positive amount.
    pub fn signed(&self, amount: i64) -> i64 {
        if self.is_debit() { -amount } else { amount }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One wallet per user, created lazily on first credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: i64,
    pub user_id: UserId,
    /// Never negative after a committed operation.
    pub balance: i64,
    /// Reserved for a hold/release flow; nothing reads or writes it yet.
    pub frozen_balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: i64,
    pub user_id: UserId,
    pub wallet_id: i64,
    pub change_amount: i64,
    pub before_balance: i64,
    pub after_balance: i64,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub biz_order_id: String,
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWalletTransaction {
    pub user_id: UserId,
    pub wallet_id: i64,
    pub change_amount: i64,
    pub before_balance: i64,
    pub after_balance: i64,
    pub kind: TransactionKind,
    pub biz_order_id: String,
    pub remark: String,
}

/// Availability of a companion for new orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompanionStatus {
    #[default]
    Offline,
    Online,
    Busy,
}

impl CompanionStatus {
    pub fn code(&self) -> i16 {
        match self {
            CompanionStatus::Offline => 0,
            CompanionStatus::Online => 1,
            CompanionStatus::Busy => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(CompanionStatus::Offline),
            1 => Some(CompanionStatus::Online),
            2 => Some(CompanionStatus::Busy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionProfile {
    pub user_id: UserId,
    /// Price in the smallest currency unit per 60 minutes.
    pub price_per_hour: i64,
    pub status: CompanionStatus,
    /// Weighted average of all ratings received, 0 to 5.
    pub rating: f64,
    pub total_orders: i64,
    pub updated_at: DateTime<Utc>,
}

impl CompanionProfile {
    pub fn new(user_id: UserId, price_per_hour: i64) -> Self {
        Self {
            user_id,
            price_per_hour,
            status: CompanionStatus::Online,
            rating: 0.0,
            total_orders: 0,
            updated_at: Utc::now(),
        }
    }

    /// Folds `delta_orders` new orders rated `new_rating` into the average.
    pub fn record_rating(&mut self, new_rating: f64, delta_orders: i64) {
        let old_orders = self.total_orders;
        self.total_orders += delta_orders;
        if self.total_orders > 0 {
            self.rating = (self.rating * old_orders as f64 + new_rating * delta_orders as f64)
                / self.total_orders as f64;
        }
        self.updated_at = Utc::now();
    }
}

/// Follow-graph counters of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub user_id: UserId,
    pub follower_count: i64,
    pub following_count: i64,
}

impl UserStats {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            follower_count: 0,
            following_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_is_the_only_debit() {
        assert_eq!(TransactionKind::Consume.signed(300), -300);
        assert_eq!(TransactionKind::Recharge.signed(300), 300);
        assert_eq!(TransactionKind::Refund.signed(300), 300);
    }

    #[test]
    fn test_kind_parse_roundtrip() {
        for kind in [TransactionKind::Consume, TransactionKind::Recharge, TransactionKind::Refund] {
            assert_eq!(TransactionKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(TransactionKind::parse("WITHDRAW").is_err());
    }

    #[test]
    fn test_companion_status_codes() {
        for status in [CompanionStatus::Offline, CompanionStatus::Online, CompanionStatus::Busy] {
            assert_eq!(CompanionStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(CompanionStatus::from_code(3), None);
    }

    #[test]
    fn test_weighted_rating() {
        let mut profile = CompanionProfile::new(UserId::new(2), 6000);
        profile.record_rating(5.0, 1);
        profile.record_rating(3.0, 1);
        assert_eq!(profile.total_orders, 2);
        assert!((profile.rating - 4.0).abs() < f64::EPSILON);
    }
}
