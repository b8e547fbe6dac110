use async_trait::async_trait;
use common::UserId;
use outbox::{NewOutboxEvent, ProcessedMessage, Result};

use crate::model::{CompanionProfile, NewWalletTransaction, TransactionKind, UserStats, Wallet, WalletTransaction};

/// Persistence of the user service.
///
/// Reads on the store itself see committed state only. Everything that
/// writes goes through a [`UserTx`].
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UserTx>>;

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<Wallet>>;

    /// Ledger row for an idempotency key.
    async fn find_transaction(&self, kind: TransactionKind, biz_order_id: &str) -> Result<Option<WalletTransaction>>;

    /// A user's ledger, oldest first.
    async fn list_transactions(&self, user_id: UserId) -> Result<Vec<WalletTransaction>>;

    async fn find_companion(&self, user_id: UserId) -> Result<Option<CompanionProfile>>;

    /// Follow counters; zero for users never followed.
    async fn find_stats(&self, user_id: UserId) -> Result<UserStats>;
}

/// An open local transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait UserTx: Send {
    async fn find_transaction(&mut self, kind: TransactionKind, biz_order_id: &str) -> Result<Option<WalletTransaction>>;

    /// Reads the wallet and locks it until the transaction ends.
    async fn lock_wallet(&mut self, user_id: UserId) -> Result<Option<Wallet>>;

    /// Creates a zero-balance wallet, or locks the one a concurrent
    /// transaction created first.
    async fn create_wallet(&mut self, user_id: UserId) -> Result<Wallet>;

    async fn update_balance(&mut self, wallet_id: i64, balance: i64) -> Result<()>;

    /// Appends a ledger row. A repeated idempotency key fails with
    /// [`outbox::StoreError::Duplicate`].
    async fn insert_transaction(&mut self, new: &NewWalletTransaction) -> Result<WalletTransaction>;

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64>;

    async fn is_processed(&mut self, message_id: &str) -> Result<bool>;

    async fn mark_processed(&mut self, marker: &ProcessedMessage) -> Result<()>;

    async fn lock_companion(&mut self, user_id: UserId) -> Result<Option<CompanionProfile>>;

    /// Inserts or replaces a companion profile.
    async fn save_companion(&mut self, profile: &CompanionProfile) -> Result<()>;

    /// Adds `delta` to the target's follower count and the follower's
    /// following count, flooring both at zero.
    async fn adjust_follow_counts(&mut self, follower: UserId, following: UserId, delta: i64) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
