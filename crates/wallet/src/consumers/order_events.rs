use async_trait::async_trait;
use broker::{ConsumeOutcome, LocalTransactionState, Message, MessageHandler, TransactionalPublisher};
use common::{
    DecodeError, EventTag, OrderCancelled, OrderCompleted, OrderEvent, PaymentFailed, PaymentPending, PaymentSucceeded,
    RefundSucceeded,
};

use crate::error::{Result, WalletError};
use crate::model::{CompanionStatus, TransactionKind};
use crate::service::{AppliedChange, BalanceChange, EmitOutboxEvent, LedgerHook, WalletService};
use crate::store::{UserStore, UserTx};

/// Puts a busy companion back online in the same transaction that pays them.
pub struct ReleaseCompanion;

#[async_trait]
impl LedgerHook for ReleaseCompanion {
    async fn run(&self, tx: &mut dyn UserTx, applied: &AppliedChange<'_>) -> Result<()> {
        if let Some(mut profile) = tx.lock_companion(applied.change.user_id).await?
            && profile.status == CompanionStatus::Busy
        {
            profile.status = CompanionStatus::Online;
            profile.updated_at = chrono::Utc::now();
            tx.save_companion(&profile).await?;
        }
        Ok(())
    }
}

/// Drives the wallet side of the saga from the order events topic.
pub struct OrderEventsConsumer<S> {
    wallet: WalletService<S>,
    refunds: TransactionalPublisher,
}

impl<S: UserStore> OrderEventsConsumer<S> {
    /// `refunds` must be bound to a [`crate::RefundTransactionListener`].
    pub fn new(wallet: WalletService<S>, refunds: TransactionalPublisher) -> Self {
        Self { wallet, refunds }
    }

    /// Debits the boss and announces the result. A refused debit is a
    /// business outcome, not a failure: it is reported as `PAYMENT_FAILED`.
    async fn on_payment_pending(&self, p: PaymentPending) -> ConsumeOutcome {
        let succeeded = OrderEvent::PaymentSucceeded(PaymentSucceeded {
            order_id: p.order_id,
            order_no: p.order_no.clone(),
            boss_id: p.boss_id,
            amount: p.amount,
            biz_order_id: p.biz_order_id.clone(),
        });
        let hook = match EmitOutboxEvent::new(&succeeded) {
            Ok(hook) => hook,
            Err(e) => return ConsumeOutcome::Retry(e.to_string()),
        };
        let change = BalanceChange::new(p.boss_id, p.amount, TransactionKind::Consume)
            .with_biz_order_id(p.biz_order_id.clone())
            .with_remark(format!("order {} payment", p.order_no));

        match self.wallet.update_balance(change, Some(&hook)).await {
            Ok(_) => ConsumeOutcome::Success,
            Err(e @ (WalletError::WalletNotFound(_) | WalletError::InsufficientBalance { .. })) => {
                self.report_payment_failed(&p, e.to_string()).await
            }
            Err(e) if e.is_transient() => ConsumeOutcome::Retry(e.to_string()),
            Err(e) => {
                tracing::warn!(order_no = %p.order_no, error = %e, "payment request dropped");
                ConsumeOutcome::Success
            }
        }
    }

    async fn report_payment_failed(&self, p: &PaymentPending, reason: String) -> ConsumeOutcome {
        let failed = OrderEvent::PaymentFailed(PaymentFailed {
            order_id: p.order_id,
            order_no: p.order_no.clone(),
            boss_id: p.boss_id,
            amount: p.amount,
            biz_order_id: p.biz_order_id.clone(),
            reason,
        });
        let key = format!("payment-failed:{}", p.biz_order_id);
        match self.wallet.record_event_once(&failed, &key).await {
            Ok(Some(_)) => {
                tracing::info!(order_no = %p.order_no, "payment failure reported");
                ConsumeOutcome::Success
            }
            Ok(None) => {
                tracing::debug!(order_no = %p.order_no, "payment failure already reported");
                ConsumeOutcome::Success
            }
            Err(e) => ConsumeOutcome::Retry(e.to_string()),
        }
    }

    /// Refunds the boss through the refund half message.
    async fn on_order_cancelled(&self, p: OrderCancelled) -> ConsumeOutcome {
        if !p.need_refund {
            tracing::debug!(order_no = %p.order_no, "cancelled before payment, nothing to refund");
            return ConsumeOutcome::Success;
        }

        match self
            .wallet
            .store()
            .find_transaction(TransactionKind::Consume, &p.biz_order_id)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::info!(order_no = %p.order_no, "nothing was debited, refund skipped");
                return ConsumeOutcome::Success;
            }
            Err(e) => return ConsumeOutcome::Retry(e.to_string()),
        }

        let message = match refund_message(&p) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(order_no = %p.order_no, error = %e, "cannot build refund message");
                return ConsumeOutcome::Success;
            }
        };

        match self.refunds.publish(message).await {
            Ok(result) => {
                match result.state {
                    LocalTransactionState::Commit => {
                        tracing::info!(order_no = %p.order_no, amount = p.amount, "refund committed");
                    }
                    LocalTransactionState::Unknown => {
                        tracing::info!(order_no = %p.order_no, "refund outcome pending check-back");
                    }
                    LocalTransactionState::Rollback => {
                        tracing::error!(order_no = %p.order_no, "refund rolled back");
                    }
                }
                ConsumeOutcome::Success
            }
            Err(e) => ConsumeOutcome::Retry(e.to_string()),
        }
    }

    /// Pays the companion and releases them.
    async fn on_order_completed(&self, p: OrderCompleted) -> ConsumeOutcome {
        let change = BalanceChange::new(p.companion_id, p.amount, TransactionKind::Recharge)
            .with_biz_order_id(p.biz_order_id.clone())
            .with_remark("order completed payment");

        match self.wallet.update_balance(change, Some(&ReleaseCompanion)).await {
            Ok(_) => ConsumeOutcome::Success,
            Err(e) if e.is_transient() => ConsumeOutcome::Retry(e.to_string()),
            Err(e) => {
                tracing::warn!(order_no = %p.order_no, error = %e, "companion payout dropped");
                ConsumeOutcome::Success
            }
        }
    }
}

fn refund_message(p: &OrderCancelled) -> broker::Result<Message> {
    let refund = RefundSucceeded {
        order_id: p.order_id,
        order_no: p.order_no.clone(),
        biz_order_id: p.biz_order_id.clone(),
        user_id: p.boss_id,
        amount: p.amount,
    };
    Message::for_event(EventTag::OrderRefundSucceeded)
        .key(p.order_no.clone())
        .json_body(&refund)
        .map_err(|_| broker::BrokerError::InvalidMessage("refund payload is not serializable"))?
        .build()
}

#[async_trait]
impl<S: UserStore + 'static> MessageHandler for OrderEventsConsumer<S> {
    fn name(&self) -> &'static str {
        "wallet-order-events"
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, tag = %message.tag))]
    async fn handle(&self, message: &Message) -> ConsumeOutcome {
        let event = match OrderEvent::decode(&message.tag, &message.body) {
            Ok(event) => event,
            Err(DecodeError::UnknownTag(_)) => return ConsumeOutcome::Success,
            Err(e) => {
                tracing::error!(error = %e, "poison message dropped");
                return ConsumeOutcome::Success;
            }
        };

        match event {
            OrderEvent::PaymentPending(p) => self.on_payment_pending(p).await,
            OrderEvent::OrderCancelled(p) => self.on_order_cancelled(p).await,
            OrderEvent::OrderCompleted(p) => self.on_order_completed(p).await,
            _ => ConsumeOutcome::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use broker::{CheckBackOptions, InMemoryBroker};
    use common::{OrderId, UserId};

    use super::*;
    use crate::CompanionService;
    use crate::listener::RefundTransactionListener;
    use crate::memory::InMemoryUserStore;

    const BOSS: UserId = UserId::new(1001);
    const COMPANION: UserId = UserId::new(2001);

    struct Fixture {
        store: InMemoryUserStore,
        broker: InMemoryBroker,
        consumer: OrderEventsConsumer<InMemoryUserStore>,
        wallet: WalletService<InMemoryUserStore>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryUserStore::new();
        let broker = InMemoryBroker::new();
        let wallet = WalletService::new(store.clone());
        let refunds = TransactionalPublisher::new(
            Arc::new(broker.clone()),
            crate::PRODUCER_GROUP,
            Arc::new(RefundTransactionListener::new(wallet.clone())),
            CheckBackOptions::default(),
        );
        Fixture {
            consumer: OrderEventsConsumer::new(wallet.clone(), refunds),
            store,
            broker,
            wallet,
        }
    }

    fn message(event: &OrderEvent) -> Message {
        Message::for_event(event.tag())
            .body(event.to_body().unwrap())
            .build()
            .unwrap()
    }

    fn pending(amount: i64) -> OrderEvent {
        OrderEvent::PaymentPending(PaymentPending {
            order_id: OrderId::new(1),
            order_no: "20260101000001".into(),
            boss_id: BOSS,
            companion_id: COMPANION,
            amount,
            biz_order_id: "BIZ-1".into(),
            game_name: "chess".into(),
            game_mode: "blitz".into(),
            duration_minutes: 60,
            price_per_hour: amount,
        })
    }

    #[tokio::test]
    async fn test_payment_pending_debits_and_emits_success() {
        let f = fixture();
        f.wallet.recharge(BOSS, 1000, "r-1", "").await.unwrap();

        let outcome = f.consumer.handle(&message(&pending(300))).await;

        assert_eq!(outcome, ConsumeOutcome::Success);
        assert_eq!(f.wallet.get_wallet(BOSS).await.unwrap().balance, 700);
        let rows = f.store.outbox_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "PAYMENT_SUCCEEDED");
    }

    #[tokio::test]
    async fn test_replayed_payment_pending_writes_nothing() {
        let f = fixture();
        f.wallet.recharge(BOSS, 1000, "r-1", "").await.unwrap();
        let msg = message(&pending(300));

        f.consumer.handle(&msg).await;
        f.consumer.handle(&msg).await;

        assert_eq!(f.wallet.get_wallet(BOSS).await.unwrap().balance, 700);
        assert_eq!(f.store.outbox_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_balance_emits_payment_failed() {
        let f = fixture();
        f.wallet.recharge(BOSS, 100, "r-1", "").await.unwrap();

        let outcome = f.consumer.handle(&message(&pending(300))).await;

        assert_eq!(outcome, ConsumeOutcome::Success);
        assert_eq!(f.wallet.get_wallet(BOSS).await.unwrap().balance, 100);
        let rows = f.store.outbox_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "PAYMENT_FAILED");
        assert!(rows[0].payload.contains("insufficient balance"));
    }

    #[tokio::test]
    async fn test_redelivered_refusal_reports_once() {
        let f = fixture();
        f.wallet.recharge(BOSS, 100, "r-1", "").await.unwrap();
        let msg = message(&pending(300));

        assert_eq!(f.consumer.handle(&msg).await, ConsumeOutcome::Success);
        assert_eq!(f.consumer.handle(&msg).await, ConsumeOutcome::Success);

        let rows = f.store.outbox_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "PAYMENT_FAILED");
        assert_eq!(f.store.processed_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_wallet_emits_payment_failed() {
        let f = fixture();

        f.consumer.handle(&message(&pending(300))).await;

        let rows = f.store.outbox_rows().await;
        assert_eq!(rows[0].event_type, "PAYMENT_FAILED");
        assert!(rows[0].payload.contains("wallet not found"));
    }

    #[tokio::test]
    async fn test_store_outage_is_retried() {
        let f = fixture();
        f.store.set_unavailable(true);

        let outcome = f.consumer.handle(&message(&pending(300))).await;

        assert!(matches!(outcome, ConsumeOutcome::Retry(_)));
    }

    #[tokio::test]
    async fn test_poison_is_dropped() {
        let f = fixture();
        let poison = Message::for_event(EventTag::PaymentPending)
            .body(r#"{"order_id":1,"order_no":"x","boss_id":0,"companion_id":2,"amount":5,"biz_order_id":"b"}"#)
            .build()
            .unwrap();

        assert_eq!(f.consumer.handle(&poison).await, ConsumeOutcome::Success);
        assert!(f.store.outbox_rows().await.is_empty());
    }

    fn cancelled(need_refund: bool) -> OrderEvent {
        OrderEvent::OrderCancelled(OrderCancelled {
            order_id: OrderId::new(1),
            order_no: "20260101000001".into(),
            boss_id: BOSS,
            companion_id: COMPANION,
            amount: 300,
            biz_order_id: "BIZ-1".into(),
            need_refund,
            cancel_reason: "changed my mind".into(),
        })
    }

    #[tokio::test]
    async fn test_cancel_refunds_once_and_publishes() {
        let f = fixture();
        f.wallet.recharge(BOSS, 1000, "r-1", "").await.unwrap();
        f.consumer.handle(&message(&pending(300))).await;
        let msg = message(&cancelled(true));

        f.consumer.handle(&msg).await;
        f.consumer.handle(&msg).await;

        assert_eq!(f.wallet.get_wallet(BOSS).await.unwrap().balance, 1000);
        let refunds = f.broker.published_with_tag("ORDER_REFUND_SUCCEEDED").await;
        assert_eq!(refunds.len(), 2);
        assert_eq!(refunds[0].key.as_deref(), Some("20260101000001"));
    }

    #[tokio::test]
    async fn test_cancel_without_refund_is_a_no_op() {
        let f = fixture();

        assert_eq!(f.consumer.handle(&message(&cancelled(false))).await, ConsumeOutcome::Success);
        assert!(f.broker.published().await.is_empty());
        assert!(f.store.all_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_refund_skipped_when_nothing_was_debited() {
        let f = fixture();
        f.wallet.recharge(BOSS, 1000, "r-1", "").await.unwrap();

        let outcome = f.consumer.handle(&message(&cancelled(true))).await;

        assert_eq!(outcome, ConsumeOutcome::Success);
        assert_eq!(f.wallet.get_wallet(BOSS).await.unwrap().balance, 1000);
        assert!(f.broker.published_with_tag("ORDER_REFUND_SUCCEEDED").await.is_empty());
    }

    #[tokio::test]
    async fn test_completion_pays_and_releases_companion() {
        let f = fixture();
        let companions = CompanionService::new(f.store.clone());
        companions.upsert_companion(COMPANION, 300, None).await.unwrap();
        companions.update_companion_status(COMPANION, 2).await.unwrap();
        let completed = OrderEvent::OrderCompleted(OrderCompleted {
            order_id: OrderId::new(1),
            order_no: "20260101000001".into(),
            boss_id: BOSS,
            companion_id: COMPANION,
            amount: 300,
            biz_order_id: "BIZ-1".into(),
        });
        let msg = message(&completed);

        f.consumer.handle(&msg).await;
        f.consumer.handle(&msg).await;

        let wallet = f.wallet.get_wallet(COMPANION).await.unwrap();
        assert_eq!(wallet.balance, 300);
        let ledger = f.wallet.list_transactions(COMPANION).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].remark, "order completed payment");
        assert_eq!(companions.get_companion(COMPANION).await.unwrap().status, CompanionStatus::Online);
    }
}
