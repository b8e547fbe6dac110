use async_trait::async_trait;
use broker::{ConsumeOutcome, Message, MessageHandler};
use chrono::Utc;
use common::{DecodeError, OrderEvent, OrderId};
use outbox::{NewOutboxEvent, StoreError};

use crate::model::{Order, PaymentConfirmation};
use crate::service::{record_transition, rollback_quietly};
use crate::store::{OrderStore, lock_order};

/// Tags the order service consumes from the order events topic.
pub const SETTLEMENT_TAGS: &str = "PAYMENT_SUCCEEDED || PAYMENT_FAILED || ORDER_REFUND_SUCCEEDED";

/// What an event does to the locked order.
enum Effect {
    Save,
    /// Save and queue a refund request for a debit that arrived too late.
    SaveAndRefund(NewOutboxEvent),
    /// Already applied or out of order.
    Skip(&'static str),
}

/// Applies the wallet's answers to orders.
///
/// There is no processed-message marker here: every event is gated on
/// the order's current status, so a redelivery finds the order already
/// past the event and does nothing.
pub struct SettlementConsumer<S> {
    store: S,
}

impl<S: OrderStore> SettlementConsumer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn apply<F>(&self, order_no: &str, order_id: OrderId, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Order) -> Result<Effect, StoreError> + Send,
    {
        let mut tx = self.store.begin().await?;
        let staged = async {
            let Some(mut order) = lock_order(tx.as_mut(), order_no, order_id).await? else {
                return Ok(None);
            };
            let before = order.status;
            match f(&mut order)? {
                Effect::Save => tx.save_order(&order).await?,
                Effect::SaveAndRefund(event) => {
                    tx.save_order(&order).await?;
                    tx.insert_outbox(&event).await?;
                    tracing::warn!(order_no = %order.order_no, "payment arrived after cancellation, refund requested");
                }
                Effect::Skip(why) => {
                    tracing::info!(order_no = %order.order_no, status = %order.status, why, "event skipped");
                    return Ok(None);
                }
            }
            Ok::<_, StoreError>(Some((before, order)))
        }
        .await;

        match staged {
            Ok(Some((before, order))) => {
                tx.commit().await?;
                if order.status != before {
                    record_transition(order.status);
                    tracing::info!(order_no = %order.order_no, from = %before, to = %order.status, "order updated");
                }
                Ok(())
            }
            Ok(None) => {
                rollback_quietly(tx).await;
                Ok(())
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn on_event(&self, event: OrderEvent) -> Result<(), StoreError> {
        match event {
            OrderEvent::PaymentSucceeded(p) => {
                self.apply(&p.order_no, p.order_id, |order| {
                    Ok(match order.confirm_payment(Utc::now()) {
                        PaymentConfirmation::Paid => Effect::Save,
                        PaymentConfirmation::Refund => {
                            let refund = OrderEvent::OrderCancelled(order.cancelled_event(true));
                            Effect::SaveAndRefund(NewOutboxEvent::from_order_event(&refund)?)
                        }
                        PaymentConfirmation::Ignored => Effect::Skip("payment already applied"),
                    })
                })
                .await
            }
            OrderEvent::PaymentFailed(p) => {
                self.apply(&p.order_no, p.order_id, |order| {
                    if !order.status.can_pay() {
                        return Ok(Effect::Skip("order is past payment"));
                    }
                    match order.cancel(format!("payment failed: {}", p.reason), Utc::now()) {
                        Ok(_) => Ok(Effect::Save),
                        Err(_) => Ok(Effect::Skip("order cannot be cancelled")),
                    }
                })
                .await
            }
            OrderEvent::RefundSucceeded(p) => {
                self.apply(&p.order_no, p.order_id, |order| {
                    Ok(match order.finish_refund(Utc::now()) {
                        Ok(()) => Effect::Save,
                        Err(_) => Effect::Skip("order is not awaiting a refund"),
                    })
                })
                .await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<S: OrderStore + 'static> MessageHandler for SettlementConsumer<S> {
    fn name(&self) -> &'static str {
        "order-settlement"
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

        match self.on_event(event).await {
            Ok(()) => ConsumeOutcome::Success,
            Err(e) => ConsumeOutcome::Retry(e.to_string()),
        }
    }
}
