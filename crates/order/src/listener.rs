use async_trait::async_trait;
use broker::{LocalTransactionState, Message, TransactionListener};
use chrono::Utc;
use common::{OrderCancelled, OrderCompleted, OrderEvent, PaymentPending};
use outbox::StoreError;

use crate::model::{NewOrder, Order};
use crate::service::{record_transition, rollback_quietly};
use crate::state::OrderStatus;
use crate::store::{OrderStore, find_order, lock_order};

/// Local side of the order service's half messages.
///
/// * `PAYMENT_PENDING` inserts the CREATED order.
/// * `ORDER_CANCELLED` moves the order to CANCEL_REFUNDING or CANCELLED.
/// * `ORDER_COMPLETED` moves the order to COMPLETED.
///
/// Each local transaction is idempotent: if the target state is already
/// in place the answer is COMMIT, so a redelivered callback or a
/// check-back after a lost acknowledgement agrees with the first run.
pub struct OrderTransactionListener<S> {
    store: S,
}

/// Message property naming the status a cancel was authorised against.
/// The local transaction refuses to cancel from any other status, since
/// who may cancel depends on it.
pub const EXPECTED_STATUS_PROPERTY: &str = "expected_status";

/// Whether an order's cancellation agrees with the refund flag a message
/// carries. Once the refund has landed the order is plain CANCELLED
/// either way.
fn cancellation_matches(order: &Order, need_refund: bool) -> bool {
    match order.status {
        OrderStatus::CancelRefunding => need_refund,
        OrderStatus::Cancelled => true,
        _ => false,
    }
}

impl<S: OrderStore> OrderTransactionListener<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn create(&self, p: &PaymentPending) -> Result<LocalTransactionState, StoreError> {
        let new = match NewOrder::from_pending(p) {
            Ok(new) => new,
            Err(e) => {
                tracing::error!(error = %e, "payment request carries an invalid order");
                return Ok(LocalTransactionState::Rollback);
            }
        };

        let mut tx = self.store.begin().await?;
        match tx.insert_order(&new).await {
            Ok(_) => {
                tx.commit().await?;
                record_transition(OrderStatus::Created);
                Ok(LocalTransactionState::Commit)
            }
            Err(e) if e.is_duplicate() => {
                rollback_quietly(tx).await;
                // Same order already inserted by an earlier run; a different
                // order holding the number means this one must not exist.
                match self.store.find_by_order_no(&new.order_no).await? {
                    Some(existing) if existing.id == new.id => Ok(LocalTransactionState::Commit),
                    _ => {
                        tracing::warn!(order_no = %new.order_no, "order number already taken");
                        Ok(LocalTransactionState::Rollback)
                    }
                }
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn cancel(&self, p: &OrderCancelled, expected: Option<&str>) -> Result<LocalTransactionState, StoreError> {
        let mut tx = self.store.begin().await?;
        let Some(mut order) = lock_order(tx.as_mut(), &p.order_no, p.order_id).await? else {
            rollback_quietly(tx).await;
            return Ok(LocalTransactionState::Rollback);
        };

        if order.status.is_cancelled() {
            tx.rollback().await?;
            return Ok(if cancellation_matches(&order, p.need_refund) {
                LocalTransactionState::Commit
            } else {
                LocalTransactionState::Rollback
            });
        }

        if let Some(expected) = expected
            && order.status.as_str() != expected
        {
            tracing::warn!(order_no = %order.order_no, %expected, status = %order.status, "order moved on since the cancel was requested");
            tx.rollback().await?;
            return Ok(LocalTransactionState::Rollback);
        }

        match order.cancel(p.cancel_reason.clone(), Utc::now()) {
            Ok(need_refund) if need_refund == p.need_refund => {
                tx.save_order(&order).await?;
                tx.commit().await?;
                record_transition(order.status);
                Ok(LocalTransactionState::Commit)
            }
            Ok(_) => {
                tracing::warn!(order_no = %order.order_no, "order was paid or refunded since the cancel was requested");
                tx.rollback().await?;
                Ok(LocalTransactionState::Rollback)
            }
            Err(e) => {
                tracing::warn!(order_no = %order.order_no, error = %e, "cancel no longer applies");
                tx.rollback().await?;
                Ok(LocalTransactionState::Rollback)
            }
        }
    }

    async fn complete(&self, p: &OrderCompleted) -> Result<LocalTransactionState, StoreError> {
        let mut tx = self.store.begin().await?;
        let Some(mut order) = lock_order(tx.as_mut(), &p.order_no, p.order_id).await? else {
            rollback_quietly(tx).await;
            return Ok(LocalTransactionState::Rollback);
        };

        if matches!(order.status, OrderStatus::Completed | OrderStatus::Rated) {
            tx.rollback().await?;
            return Ok(LocalTransactionState::Commit);
        }

        match order.complete(Utc::now()) {
            Ok(()) => {
                tx.save_order(&order).await?;
                tx.commit().await?;
                record_transition(order.status);
                Ok(LocalTransactionState::Commit)
            }
            Err(e) => {
                tracing::warn!(order_no = %order.order_no, error = %e, "complete no longer applies");
                tx.rollback().await?;
                Ok(LocalTransactionState::Rollback)
            }
        }
    }

    async fn check(&self, event: &OrderEvent) -> Result<LocalTransactionState, StoreError> {
        let state = match event {
            OrderEvent::PaymentPending(p) => match self.store.find_by_order_no(&p.order_no).await? {
                Some(order) if order.id == p.order_id => LocalTransactionState::Commit,
                _ => LocalTransactionState::Rollback,
            },
            OrderEvent::OrderCancelled(p) => match find_order(&self.store, &p.order_no, p.order_id).await? {
                Some(order) if cancellation_matches(&order, p.need_refund) => LocalTransactionState::Commit,
                _ => LocalTransactionState::Rollback,
            },
            OrderEvent::OrderCompleted(p) => match find_order(&self.store, &p.order_no, p.order_id).await? {
                Some(order) if matches!(order.status, OrderStatus::Completed | OrderStatus::Rated) => {
                    LocalTransactionState::Commit
                }
                _ => LocalTransactionState::Rollback,
            },
            _ => LocalTransactionState::Unknown,
        };
        Ok(state)
    }
}

#[async_trait]
impl<S: OrderStore + 'static> TransactionListener for OrderTransactionListener<S> {
    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, tag = %message.tag))]
    async fn execute_local(&self, message: &Message) -> LocalTransactionState {
        let event = match OrderEvent::decode(&message.tag, &message.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "order message rejected");
                return LocalTransactionState::Rollback;
            }
        };

        let result = match &event {
            OrderEvent::PaymentPending(p) => self.create(p).await,
            OrderEvent::OrderCancelled(p) => self.cancel(p, message.property(EXPECTED_STATUS_PROPERTY)).await,
            OrderEvent::OrderCompleted(p) => self.complete(p).await,
            other => {
                tracing::error!(tag = %other.tag(), "not an order service transaction");
                return LocalTransactionState::Rollback;
            }
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "local transaction outcome unknown");
            LocalTransactionState::Unknown
        })
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, tag = %message.tag))]
    async fn check_local(&self, message: &Message) -> LocalTransactionState {
        let event = match OrderEvent::decode(&message.tag, &message.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "cannot check order message");
                return LocalTransactionState::Unknown;
            }
        };

        self.check(&event).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "order check failed");
            LocalTransactionState::Unknown
        })
    }
}
