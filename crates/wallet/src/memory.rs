use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::UserId;
use outbox::{
    NewOutboxEvent, OutboxEvent, OutboxStore, OutboxTable, ProcessedMessage, ProcessedTable, Result, StoreError,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{CompanionProfile, NewWalletTransaction, TransactionKind, UserStats, Wallet, WalletTransaction};
use crate::store::{UserStore, UserTx};

#[derive(Debug, Clone, Default)]
struct UserTables {
    wallets: HashMap<UserId, Wallet>,
    next_wallet_id: i64,
    transactions: Vec<WalletTransaction>,
    next_transaction_id: i64,
    companions: HashMap<UserId, CompanionProfile>,
    stats: HashMap<UserId, UserStats>,
    outbox: OutboxTable,
    processed: ProcessedTable,
}

/// In-memory user store for tests and the single-process binary.
///
/// A transaction holds the store lock until it ends and stages its writes
/// on a copy of the tables, so transactions are serialized and a rollback
/// discards everything. Store-level reads must not be issued while the
/// same task holds an open transaction.
#[derive(Clone, Default)]
pub struct InMemoryUserStore {
    tables: Arc<Mutex<UserTables>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    /// Every outbox row, in creation order.
    pub async fn outbox_rows(&self) -> Vec<OutboxEvent> {
        self.tables.lock().await.outbox.rows().to_vec()
    }

    pub async fn processed_count(&self) -> usize {
        self.tables.lock().await.processed.len()
    }

    /// Every ledger row of every user.
    pub async fn all_transactions(&self) -> Vec<WalletTransaction> {
        self.tables.lock().await.transactions.clone()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn begin(&self) -> Result<Box<dyn UserTx>> {
        self.check_available()?;
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryUserTx { guard, staged }))
    }

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<Wallet>> {
        self.check_available()?;
        Ok(self.tables.lock().await.wallets.get(&user_id).cloned())
    }

    async fn find_transaction(&self, kind: TransactionKind, biz_order_id: &str) -> Result<Option<WalletTransaction>> {
        self.check_available()?;
        Ok(find_by_key(&self.tables.lock().await.transactions, kind, biz_order_id))
    }

    async fn list_transactions(&self, user_id: UserId) -> Result<Vec<WalletTransaction>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_companion(&self, user_id: UserId) -> Result<Option<CompanionProfile>> {
        self.check_available()?;
        Ok(self.tables.lock().await.companions.get(&user_id).cloned())
    }

    async fn find_stats(&self, user_id: UserId) -> Result<UserStats> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .stats
            .get(&user_id)
            .copied()
            .unwrap_or_else(|| UserStats::empty(user_id)))
    }
}

#[async_trait]
impl OutboxStore for InMemoryUserStore {
    async fn fetch_dispatchable(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxEvent>> {
        self.check_available()?;
        Ok(self.tables.lock().await.outbox.fetch_dispatchable(limit, max_attempts))
    }

    async fn mark_sent(&self, id: i64, attempts: i32) -> Result<()> {
        self.check_available()?;
        self.tables.lock().await.outbox.mark_sent(id, attempts);
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str, attempts: i32) -> Result<()> {
        self.check_available()?;
        self.tables.lock().await.outbox.mark_failed(id, error, attempts);
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>> {
        self.check_available()?;
        Ok(self.tables.lock().await.outbox.get(id))
    }
}

fn find_by_key(rows: &[WalletTransaction], kind: TransactionKind, biz_order_id: &str) -> Option<WalletTransaction> {
    if biz_order_id.is_empty() {
        return None;
    }
    rows.iter()
        .find(|t| t.kind == kind && t.biz_order_id == biz_order_id)
        .cloned()
}

struct InMemoryUserTx {
    guard: OwnedMutexGuard<UserTables>,
    staged: UserTables,
}

#[async_trait]
impl UserTx for InMemoryUserTx {
    async fn find_transaction(&mut self, kind: TransactionKind, biz_order_id: &str) -> Result<Option<WalletTransaction>> {
        Ok(find_by_key(&self.staged.transactions, kind, biz_order_id))
    }

    async fn lock_wallet(&mut self, user_id: UserId) -> Result<Option<Wallet>> {
        Ok(self.staged.wallets.get(&user_id).cloned())
    }

    async fn create_wallet(&mut self, user_id: UserId) -> Result<Wallet> {
        if let Some(existing) = self.staged.wallets.get(&user_id) {
            return Ok(existing.clone());
        }
        self.staged.next_wallet_id += 1;
        let now = Utc::now();
        let wallet = Wallet {
            id: self.staged.next_wallet_id,
            user_id,
            balance: 0,
            frozen_balance: 0,
            created_at: now,
            updated_at: now,
        };
        self.staged.wallets.insert(user_id, wallet.clone());
        Ok(wallet)
    }

    async fn update_balance(&mut self, wallet_id: i64, balance: i64) -> Result<()> {
        if balance < 0 {
            return Err(StoreError::Corrupt(format!(
                "ck_wallets_balance_non_negative violated for wallet {wallet_id}"
            )));
        }
        let wallet = self
            .staged
            .wallets
            .values_mut()
            .find(|w| w.id == wallet_id)
            .ok_or_else(|| StoreError::Corrupt(format!("wallet {wallet_id} vanished")))?;
        wallet.balance = balance;
        wallet.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_transaction(&mut self, new: &NewWalletTransaction) -> Result<WalletTransaction> {
        if find_by_key(&self.staged.transactions, new.kind, &new.biz_order_id).is_some() {
            return Err(StoreError::Duplicate {
                constraint: "uk_wallet_transactions_type_biz".to_string(),
            });
        }
        self.staged.next_transaction_id += 1;
        let row = WalletTransaction {
            id: self.staged.next_transaction_id,
            user_id: new.user_id,
            wallet_id: new.wallet_id,
            change_amount: new.change_amount,
            before_balance: new.before_balance,
            after_balance: new.after_balance,
            kind: new.kind,
            biz_order_id: new.biz_order_id.clone(),
            remark: new.remark.clone(),
            created_at: Utc::now(),
        };
        self.staged.transactions.push(row.clone());
        Ok(row)
    }

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64> {
        Ok(self.staged.outbox.insert(event.clone()).id)
    }

    async fn is_processed(&mut self, message_id: &str) -> Result<bool> {
        Ok(self.staged.processed.contains(message_id))
    }

    async fn mark_processed(&mut self, marker: &ProcessedMessage) -> Result<()> {
        self.staged.processed.insert(marker.clone())
    }

    async fn lock_companion(&mut self, user_id: UserId) -> Result<Option<CompanionProfile>> {
        Ok(self.staged.companions.get(&user_id).cloned())
    }

    async fn save_companion(&mut self, profile: &CompanionProfile) -> Result<()> {
        self.staged.companions.insert(profile.user_id, profile.clone());
        Ok(())
    }

    async fn adjust_follow_counts(&mut self, follower: UserId, following: UserId, delta: i64) -> Result<()> {
        let target = self
            .staged
            .stats
            .entry(following)
            .or_insert_with(|| UserStats::empty(following));
        target.follower_count = (target.follower_count + delta).max(0);

        let source = self
            .staged
            .stats
            .entry(follower)
            .or_insert_with(|| UserStats::empty(follower));
        source.following_count = (source.following_count + delta).max(0);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryUserTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
