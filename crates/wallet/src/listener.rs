use async_trait::async_trait;
use broker::{LocalTransactionState, Message, TransactionListener};
use common::{DecodeError, OrderEvent, RefundSucceeded};

use crate::model::TransactionKind;
use crate::service::WalletService;
use crate::store::UserStore;

/// Local side of the `ORDER_REFUND_SUCCEEDED` half message: the refund
/// credit commits first, then the event becomes visible to the order
/// service.
pub struct RefundTransactionListener<S> {
    wallet: WalletService<S>,
}

impl<S: UserStore> RefundTransactionListener<S> {
    pub fn new(wallet: WalletService<S>) -> Self {
        Self { wallet }
    }

    fn decode(message: &Message) -> Result<RefundSucceeded, DecodeError> {
        match OrderEvent::decode(&message.tag, &message.body)? {
            OrderEvent::RefundSucceeded(payload) => Ok(payload),
            _ => Err(DecodeError::UnknownTag(message.tag.clone())),
        }
    }
}

#[async_trait]
impl<S: UserStore + 'static> TransactionListener for RefundTransactionListener<S> {
    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, tag = %message.tag))]
    async fn execute_local(&self, message: &Message) -> LocalTransactionState {
        let refund = match Self::decode(message) {
            Ok(refund) => refund,
            Err(e) => {
                tracing::error!(error = %e, "refund message rejected");
                return LocalTransactionState::Rollback;
            }
        };

        let remark = format!("order {} cancelled", refund.order_no);
        match self
            .wallet
            .refund(refund.user_id, refund.amount, &refund.biz_order_id, &remark)
            .await
        {
            Ok(_) => LocalTransactionState::Commit,
            // The credit may or may not have landed; let the check decide.
            Err(e) if e.is_transient() => LocalTransactionState::Unknown,
            Err(_) => LocalTransactionState::Rollback,
        }
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, tag = %message.tag))]
    async fn check_local(&self, message: &Message) -> LocalTransactionState {
        let refund = match Self::decode(message) {
            Ok(refund) => refund,
            Err(e) => {
                tracing::warn!(error = %e, "cannot check refund message");
                return LocalTransactionState::Unknown;
            }
        };

        match self
            .wallet
            .store()
            .find_transaction(TransactionKind::Refund, &refund.biz_order_id)
            .await
        {
            Ok(Some(row)) if row.user_id == refund.user_id => LocalTransactionState::Commit,
            Ok(Some(row)) => {
                tracing::error!(
                    expected = %refund.user_id,
                    found = %row.user_id,
                    "refund key belongs to another user"
                );
                LocalTransactionState::Rollback
            }
            Ok(None) => LocalTransactionState::Rollback,
            Err(e) => {
                tracing::warn!(error = %e, "refund check failed");
                LocalTransactionState::Unknown
            }
        }
    }
}
