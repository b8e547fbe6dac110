//! Idempotent wallet ledger.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use common::{ErrorCode, OrderEvent, UserId};
use outbox::{NewOutboxEvent, ProcessedMessage, StoreError};

use crate::error::{Result, WalletError};
use crate::model::{NewWalletTransaction, TransactionKind, Wallet, WalletTransaction};
use crate::store::{UserStore, UserTx};

const MAX_BIZ_ORDER_ID_LEN: usize = 64;
const MAX_REMARK_LEN: usize = 255;

/// A requested balance change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    pub user_id: UserId,
    /// Always positive; the kind decides the direction.
    pub amount: i64,
    pub kind: TransactionKind,
    /// Idempotency key together with `kind`. Empty means "not deduplicated".
    pub biz_order_id: String,
    pub remark: String,
}

impl BalanceChange {
    pub fn new(user_id: UserId, amount: i64, kind: TransactionKind) -> Self {
        Self {
            user_id,
            amount,
            kind,
            biz_order_id: String::new(),
            remark: String::new(),
        }
    }

    pub fn with_biz_order_id(mut self, biz_order_id: impl Into<String>) -> Self {
        self.biz_order_id = biz_order_id.into();
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into().chars().take(MAX_REMARK_LEN).collect();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.user_id.is_zero() {
            return Err(WalletError::InvalidArgument("user_id is required"));
        }
        if self.amount <= 0 {
            return Err(WalletError::InvalidArgument("amount must be positive"));
        }
        if self.biz_order_id.len() > MAX_BIZ_ORDER_ID_LEN {
            return Err(WalletError::InvalidArgument("biz_order_id is too long"));
        }
        if self.kind == TransactionKind::Refund && self.biz_order_id.is_empty() {
            return Err(WalletError::InvalidArgument("refund requires biz_order_id"));
        }
        Ok(())
    }
}

/// Result of [`WalletService::update_balance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdate {
    /// Wallet as of the end of the call.
    pub wallet: Wallet,
    /// The ledger row for the request; on replay, the row written the first time.
    pub transaction: WalletTransaction,
    /// True when the idempotency key had already been applied and nothing changed.
    pub replayed: bool,
}

/// A change that has been staged but not yet committed.
#[derive(Debug)]
pub struct AppliedChange<'a> {
    pub change: &'a BalanceChange,
    pub wallet: &'a Wallet,
    pub transaction: &'a WalletTransaction,
}

/// Extra writes that must commit atomically with a balance change, such
/// as an outbox row announcing it. Not invoked on replay.
#[async_trait]
pub trait LedgerHook: Send + Sync {
    async fn run(&self, tx: &mut dyn UserTx, applied: &AppliedChange<'_>) -> Result<()>;
}

/// Inserts one outbox row on the ledger transaction.
pub struct EmitOutboxEvent(pub NewOutboxEvent);

impl EmitOutboxEvent {
    pub fn new(event: &OrderEvent) -> Result<Self> {
        NewOutboxEvent::from_order_event(event)
            .map(Self)
            .map_err(|e| WalletError::Store(StoreError::Serialization(e)))
    }
}

#[async_trait]
impl LedgerHook for EmitOutboxEvent {
    async fn run(&self, tx: &mut dyn UserTx, _applied: &AppliedChange<'_>) -> Result<()> {
        tx.insert_outbox(&self.0).await?;
        Ok(())
    }
}

enum Step {
    Applied(BalanceUpdate),
    Replayed(BalanceUpdate),
    /// A concurrent transaction inserted the same key first.
    Raced,
}

/// The wallet ledger.
#[derive(Clone)]
pub struct WalletService<S> {
    store: S,
}

impl<S: UserStore> WalletService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Applies a balance change exactly once per `(kind, biz_order_id)`.
    ///
    /// The wallet row is locked, the key is checked, and the ledger row,
    /// the new balance and whatever `hook` writes commit together. A
    /// repeated key returns the current wallet with `replayed` set.
    #[tracing::instrument(
        skip(self, change, hook),
        fields(
            user_id = %change.user_id,
            kind = %change.kind,
            amount = change.amount,
            biz_order_id = %change.biz_order_id
        )
    )]
    pub async fn update_balance(&self, change: BalanceChange, hook: Option<&dyn LedgerHook>) -> Result<BalanceUpdate> {
        change.validate()?;

        let started = Instant::now();
        let result = self.apply(&change, hook).await;
        metrics::histogram!("wallet_update_balance_seconds").record(started.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(update) if update.replayed => "replayed",
            Ok(_) => "applied",
            Err(e) => match e.code() {
                ErrorCode::ResourceExhausted => "insufficient_balance",
                ErrorCode::FailedPrecondition => "no_wallet",
                ErrorCode::AlreadyExists => "key_in_use",
                _ => "error",
            },
        };
        metrics::counter!("wallet_balance_updates_total", "kind" => change.kind.as_str(), "outcome" => outcome)
            .increment(1);

        match &result {
            Ok(update) if update.replayed => {
                tracing::info!(balance = update.wallet.balance, "balance change already applied");
            }
            Ok(update) => {
                tracing::info!(
                    before = update.transaction.before_balance,
                    after = update.transaction.after_balance,
                    "balance updated"
                );
            }
            Err(e) if e.code() == ErrorCode::Internal => {
                tracing::error!(error = ?e, "balance update failed");
            }
            Err(e) => tracing::warn!(error = %e, "balance update rejected"),
        }
        result
    }

    async fn apply(&self, change: &BalanceChange, hook: Option<&dyn LedgerHook>) -> Result<BalanceUpdate> {
        let mut tx = self.store.begin().await?;
        match Self::stage(tx.as_mut(), change, hook).await {
            Ok(Step::Applied(update)) => {
                tx.commit().await?;
                Ok(update)
            }
            Ok(Step::Replayed(update)) => {
                tx.rollback().await?;
                Ok(update)
            }
            Ok(Step::Raced) => {
                rollback_quietly(tx).await;
                self.replay(change).await
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn stage(tx: &mut dyn UserTx, change: &BalanceChange, hook: Option<&dyn LedgerHook>) -> Result<Step> {
        let wallet = match tx.lock_wallet(change.user_id).await? {
            Some(wallet) => wallet,
            None if change.kind.is_debit() => return Err(WalletError::WalletNotFound(change.user_id)),
            None => tx.create_wallet(change.user_id).await?,
        };

        if let Some(existing) = tx.find_transaction(change.kind, &change.biz_order_id).await? {
            check_owner(change, &existing)?;
            return Ok(Step::Replayed(BalanceUpdate {
                wallet,
                transaction: existing,
                replayed: true,
            }));
        }

        let after = wallet
            .balance
            .checked_add(change.kind.signed(change.amount))
            .ok_or(WalletError::InvalidArgument("amount overflows the balance"))?;
        if after < 0 {
            return Err(WalletError::InsufficientBalance {
                available: wallet.balance,
                required: change.amount,
            });
        }

        let new = NewWalletTransaction {
            user_id: change.user_id,
            wallet_id: wallet.id,
            change_amount: change.kind.signed(change.amount),
            before_balance: wallet.balance,
            after_balance: after,
            kind: change.kind,
            biz_order_id: change.biz_order_id.clone(),
            remark: change.remark.clone(),
        };
        let transaction = match tx.insert_transaction(&new).await {
            Ok(row) => row,
            Err(e) if e.is_duplicate() => return Ok(Step::Raced),
            Err(e) => return Err(e.into()),
        };
        tx.update_balance(wallet.id, after).await?;

        let wallet = Wallet {
            balance: after,
            updated_at: Utc::now(),
            ..wallet
        };
        if let Some(hook) = hook {
            hook.run(
                tx,
                &AppliedChange {
                    change,
                    wallet: &wallet,
                    transaction: &transaction,
                },
            )
            .await?;
        }

        Ok(Step::Applied(BalanceUpdate {
            wallet,
            transaction,
            replayed: false,
        }))
    }

    /// Reads back the winner of a race on the idempotency key.
    async fn replay(&self, change: &BalanceChange) -> Result<BalanceUpdate> {
        let transaction = self
            .store
            .find_transaction(change.kind, &change.biz_order_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("ledger row {} vanished", change.biz_order_id)))?;
        check_owner(change, &transaction)?;
        let wallet = self
            .store
            .find_wallet(change.user_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("wallet of user {} vanished", change.user_id)))?;
        Ok(BalanceUpdate {
            wallet,
            transaction,
            replayed: true,
        })
    }

    pub async fn consume(&self, user_id: UserId, amount: i64, biz_order_id: &str, remark: &str) -> Result<BalanceUpdate> {
        let change = BalanceChange::new(user_id, amount, TransactionKind::Consume)
            .with_biz_order_id(biz_order_id)
            .with_remark(remark);
        self.update_balance(change, None).await
    }

    pub async fn recharge(&self, user_id: UserId, amount: i64, biz_order_id: &str, remark: &str) -> Result<BalanceUpdate> {
        let change = BalanceChange::new(user_id, amount, TransactionKind::Recharge)
            .with_biz_order_id(biz_order_id)
            .with_remark(remark);
        self.update_balance(change, None).await
    }

    pub async fn refund(&self, user_id: UserId, amount: i64, biz_order_id: &str, remark: &str) -> Result<BalanceUpdate> {
        let change = BalanceChange::new(user_id, amount, TransactionKind::Refund)
            .with_biz_order_id(biz_order_id)
            .with_remark(remark);
        self.update_balance(change, None).await
    }

    pub async fn get_wallet(&self, user_id: UserId) -> Result<Wallet> {
        if user_id.is_zero() {
            return Err(WalletError::InvalidArgument("user_id is required"));
        }
        self.store
            .find_wallet(user_id)
            .await?
            .ok_or(WalletError::NotFound("wallet"))
    }

    pub async fn list_transactions(&self, user_id: UserId) -> Result<Vec<WalletTransaction>> {
        if user_id.is_zero() {
            return Err(WalletError::InvalidArgument("user_id is required"));
        }
        Ok(self.store.list_transactions(user_id).await?)
    }

    /// Writes a lone outbox row, for outcomes that change no balance.
    /// `key` names the outcome: a second call with the same key writes
    /// nothing and returns `None`.
    pub async fn record_event_once(&self, event: &OrderEvent, key: &str) -> Result<Option<i64>> {
        let row = NewOutboxEvent::from_order_event(event).map_err(StoreError::Serialization)?;
        let mut tx = self.store.begin().await?;
        let staged = async {
            if tx.is_processed(key).await? {
                return Ok(None);
            }
            let id = tx.insert_outbox(&row).await?;
            tx.mark_processed(&ProcessedMessage::new(key, event.tag().as_str())).await?;
            Ok::<_, StoreError>(Some(id))
        }
        .await;

        match staged {
            Ok(Some(id)) => {
                tx.commit().await?;
                Ok(Some(id))
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(None)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e.into())
            }
        }
    }
}

pub(crate) async fn rollback_quietly(tx: Box<dyn UserTx>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

/// A key only replays the change of the user it was first used for.
fn check_owner(change: &BalanceChange, existing: &WalletTransaction) -> Result<()> {
    if existing.user_id != change.user_id {
        return Err(WalletError::KeyInUse(change.biz_order_id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use common::{OrderId, PaymentSucceeded};

    use super::*;
    use crate::memory::InMemoryUserStore;

    fn service() -> WalletService<InMemoryUserStore> {
        WalletService::new(InMemoryUserStore::new())
    }

    const BOSS: UserId = UserId::new(1001);

    #[tokio::test]
    async fn test_recharge_creates_wallet() {
        let wallet = service();

        let update = wallet.recharge(BOSS, 1000, "r-1", "top up").await.unwrap();

        assert!(!update.replayed);
        assert_eq!(update.wallet.balance, 1000);
        assert_eq!(update.transaction.before_balance, 0);
        assert_eq!(update.transaction.after_balance, 1000);
        assert_eq!(update.transaction.change_amount, 1000);
    }

    #[tokio::test]
    async fn test_consume_without_wallet_is_failed_precondition() {
        let wallet = service();

        let err = wallet.consume(BOSS, 10, "o-1", "").await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert_eq!(err.to_string(), "wallet not found, please create wallet first");
        assert_eq!(wallet.store().find_wallet(BOSS).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insufficient_balance_changes_nothing() {
        let wallet = service();
        wallet.recharge(BOSS, 500, "r-1", "").await.unwrap();

        let err = wallet.consume(BOSS, 501, "o-1", "").await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert_eq!(wallet.get_wallet(BOSS).await.unwrap().balance, 500);
        assert_eq!(wallet.list_transactions(BOSS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_down_to_zero() {
        let wallet = service();
        wallet.recharge(BOSS, 500, "r-1", "").await.unwrap();

        let update = wallet.consume(BOSS, 500, "o-1", "").await.unwrap();

        assert_eq!(update.wallet.balance, 0);
        assert_eq!(update.transaction.change_amount, -500);
    }

    #[tokio::test]
    async fn test_same_key_applies_once() {
        let wallet = service();
        wallet.recharge(BOSS, 1000, "r-1", "").await.unwrap();

        let first = wallet.consume(BOSS, 300, "BIZ-1", "").await.unwrap();
        let second = wallet.consume(BOSS, 300, "BIZ-1", "").await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.wallet.balance, 700);
        assert_eq!(second.transaction.id, first.transaction.id);
        assert_eq!(wallet.list_transactions(BOSS).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_key_of_another_user_is_rejected() {
        let wallet = service();
        let companion = UserId::new(2001);
        wallet.recharge(UserId::new(9), 1, "20260101000001", "").await.unwrap();

        let err = wallet.recharge(companion, 300, "20260101000001", "").await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        assert_eq!(wallet.store().find_wallet(companion).await.unwrap(), None);
        assert_eq!(wallet.get_wallet(UserId::new(9)).await.unwrap().balance, 1);
    }

    #[tokio::test]
    async fn test_same_biz_id_different_kind_is_distinct() {
        let wallet = service();
        wallet.recharge(BOSS, 1000, "r-1", "").await.unwrap();
        wallet.consume(BOSS, 300, "BIZ-1", "").await.unwrap();

        let refund = wallet.refund(BOSS, 300, "BIZ-1", "cancelled").await.unwrap();

        assert!(!refund.replayed);
        assert_eq!(refund.wallet.balance, 1000);
    }

    #[tokio::test]
    async fn test_keyless_changes_are_not_deduplicated() {
        let wallet = service();
        wallet.recharge(BOSS, 100, "", "").await.unwrap();
        wallet.recharge(BOSS, 100, "", "").await.unwrap();

        assert_eq!(wallet.get_wallet(BOSS).await.unwrap().balance, 200);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let wallet = service();

        let zero_amount = wallet.recharge(BOSS, 0, "r-1", "").await.unwrap_err();
        let zero_user = wallet.recharge(UserId::new(0), 10, "r-1", "").await.unwrap_err();
        let keyless_refund = wallet.refund(BOSS, 10, "", "").await.unwrap_err();

        for err in [zero_amount, zero_user, keyless_refund] {
            assert_eq!(err.code(), ErrorCode::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn test_hook_writes_commit_with_the_change() {
        let wallet = service();
        wallet.recharge(BOSS, 1000, "r-1", "").await.unwrap();
        let event = OrderEvent::PaymentSucceeded(PaymentSucceeded {
            order_id: OrderId::new(1),
            order_no: "20260101000001".into(),
            boss_id: BOSS,
            amount: 300,
            biz_order_id: "BIZ-1".into(),
        });
        let hook = EmitOutboxEvent::new(&event).unwrap();
        let change = BalanceChange::new(BOSS, 300, TransactionKind::Consume).with_biz_order_id("BIZ-1");

        wallet.update_balance(change.clone(), Some(&hook)).await.unwrap();
        wallet.update_balance(change, Some(&hook)).await.unwrap();

        let rows = wallet.store().outbox_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "PAYMENT_SUCCEEDED");
    }

    struct Refuse;

    #[async_trait]
    impl LedgerHook for Refuse {
        async fn run(&self, _tx: &mut dyn UserTx, _applied: &AppliedChange<'_>) -> Result<()> {
            Err(WalletError::Hook("downstream write failed".into()))
        }
    }

    #[tokio::test]
    async fn test_failing_hook_rolls_back_the_change() {
        let wallet = service();
        let change = BalanceChange::new(BOSS, 300, TransactionKind::Recharge).with_biz_order_id("r-1");

        let err = wallet.update_balance(change, Some(&Refuse)).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(wallet.store().find_wallet(BOSS).await.unwrap(), None);
        assert!(wallet.store().all_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_wallet_not_found() {
        let err = service().get_wallet(BOSS).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_store_outage_is_internal() {
        let wallet = service();
        wallet.store().set_unavailable(true);

        let err = wallet.recharge(BOSS, 10, "r-1", "").await.unwrap_err();

        assert!(err.is_transient());
    }
}
