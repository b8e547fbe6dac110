//! Order service: commands from bosses and companions.

use std::sync::Arc;

use broker::{LocalTransactionState, Message, MessageBuilder, TransactionSendResult, TransactionalPublisher};
use chrono::Utc;
use common::{ErrorCode, OrderEvent, OrderId, UserId};
use outbox::{NewOutboxEvent, StoreError};

use crate::client::UserClient;
use crate::commands::{CancelOrder, CreateOrder, OrderAction, RateOrder, Settlement};
use crate::error::{OrderError, Result};
use crate::listener::EXPECTED_STATUS_PROPERTY;
use crate::model::{NewOrder, Order, PaymentConfirmation, generate_order_no};
use crate::state::OrderStatus;
use crate::store::{OrderStore, OrderTx};

/// Companion status code for "busy" in the user service.
const COMPANION_BUSY: i16 = 2;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

pub(crate) fn record_transition(to: OrderStatus) {
    metrics::counter!("order_transitions_total", "to" => to.as_str()).increment(1);
}

/// Rolls back after a failure that is already being reported.
pub(crate) async fn rollback_quietly(tx: Box<dyn OrderTx>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

fn outbox_row(event: &OrderEvent) -> Result<NewOutboxEvent> {
    Ok(NewOutboxEvent::from_order_event(event).map_err(StoreError::from)?)
}

/// Service for handling order commands.
///
/// Transitions that other services react to (creation, completion,
/// cancellation) go through the transactional publisher so that the
/// event and the status change commit together. The rest are plain local
/// transactions on the locked order row.
#[derive(Clone)]
pub struct OrderService<S> {
    store: S,
    users: Arc<dyn UserClient>,
    publisher: TransactionalPublisher,
}

impl<S: OrderStore> OrderService<S> {
    /// `publisher` must be bound to an [`crate::OrderTransactionListener`]
    /// over the same store.
    pub fn new(store: S, users: Arc<dyn UserClient>, publisher: TransactionalPublisher) -> Self {
        Self {
            store,
            users,
            publisher,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Places an order.
    #[tracing::instrument(skip(self))]
    pub async fn create_order(&self, cmd: CreateOrder) -> Result<Order> {
        cmd.validate()?;

        let companion = self.users.get_companion(cmd.companion_id).await.map_err(|e| match e.code {
            ErrorCode::NotFound => OrderError::NotFound("companion"),
            _ => OrderError::Remote(e),
        })?;
        if companion.price_per_hour <= 0 {
            return Err(OrderError::FailedPrecondition("companion has not set a price".to_string()));
        }

        let total_amount = companion
            .price_per_hour
            .checked_mul(i64::from(cmd.duration_minutes))
            .map(|v| v / 60)
            .ok_or(OrderError::InvalidArgument("order amount is out of range"))?;
        if total_amount <= 0 {
            return Err(OrderError::InvalidArgument("order amount must be positive"));
        }

        self.check_balance(cmd.boss_id, total_amount).await?;

        let new = NewOrder {
            id: self.store.next_order_id().await?,
            order_no: generate_order_no(Utc::now()),
            boss_id: cmd.boss_id,
            companion_id: cmd.companion_id,
            game_name: cmd.game_name,
            game_mode: cmd.game_mode,
            duration_minutes: cmd.duration_minutes,
            price_per_hour: companion.price_per_hour,
            total_amount,
        };

        match cmd.settlement {
            Settlement::Deferred => self.create_deferred(new).await,
            Settlement::Direct => self.create_direct(new).await,
        }
    }

    async fn check_balance(&self, boss_id: UserId, required: i64) -> Result<()> {
        match self.users.get_balance(boss_id).await {
            Ok(available) if available < required => Err(OrderError::ResourceExhausted(format!(
                "insufficient balance: available {available}, required {required}"
            ))),
            Ok(_) => Ok(()),
            Err(e) if matches!(e.code, ErrorCode::NotFound | ErrorCode::FailedPrecondition) => Err(
                OrderError::FailedPrecondition("wallet not found, please create wallet first".to_string()),
            ),
            Err(e) => Err(OrderError::Remote(e)),
        }
    }

    /// The order row and `PAYMENT_PENDING` commit together; the wallet
    /// answers later with `PAYMENT_SUCCEEDED` or `PAYMENT_FAILED`.
    async fn create_deferred(&self, new: NewOrder) -> Result<Order> {
        let event = OrderEvent::PaymentPending(new.payment_pending());
        let result = self.publish(&event, &new.order_no).await?;

        match self.store.find_by_order_no(&new.order_no).await? {
            Some(order) if order.id == new.id => {
                tracing::info!(order_no = %order.order_no, amount = order.total_amount, "order created");
                Ok(order)
            }
            _ => {
                tracing::error!(order_no = %new.order_no, state = %result.state, "order missing after payment request");
                Err(OrderError::Internal("order was not created"))
            }
        }
    }

    /// Inserts the order, then debits the boss before answering.
    async fn create_direct(&self, new: NewOrder) -> Result<Order> {
        let mut tx = self.store.begin().await?;
        let order = match tx.insert_order(&new).await {
            Ok(order) => order,
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e.into());
            }
        };
        tx.commit().await?;
        record_transition(OrderStatus::Created);

        let remark = format!("order {} payment", order.order_no);
        match self
            .users
            .consume(order.boss_id, order.total_amount, order.biz_order_id(), &remark)
            .await
        {
            Ok(()) => {
                self.update(order.id, |order| match order.confirm_payment(Utc::now()) {
                    PaymentConfirmation::Refund => Ok(Some(outbox_row(&OrderEvent::OrderCancelled(
                        order.cancelled_event(true),
                    ))?)),
                    _ => Ok(None),
                })
                .await
            }
            Err(e) => {
                // An internal error leaves the debit in doubt; the refund
                // request is harmless if nothing was taken.
                let in_doubt = e.code == ErrorCode::Internal;
                let reason = format!("payment failed: {}", e.message);
                let cancelled = self
                    .update(order.id, |order| {
                        order.cancel(reason, Utc::now())?;
                        if in_doubt {
                            Ok(Some(outbox_row(&OrderEvent::OrderCancelled(order.cancelled_event(true)))?))
                        } else {
                            Ok(None)
                        }
                    })
                    .await;
                if let Err(cancel_err) = cancelled {
                    tracing::error!(order_no = %order.order_no, error = ?cancel_err, "cannot cancel unpaid order");
                }
                tracing::warn!(order_no = %order.order_no, code = %e.code, error = %e, "direct payment failed");
                Err(OrderError::Remote(e))
            }
        }
    }

    /// Companion takes a paid order.
    #[tracing::instrument(skip(self))]
    pub async fn accept_order(&self, cmd: OrderAction) -> Result<Order> {
        cmd.validate()?;
        let order = self
            .update(cmd.order_id, |order| {
                if !order.is_companion(cmd.operator_id) {
                    return Err(OrderError::PermissionDenied("only the companion can accept the order"));
                }
                order.accept(Utc::now())?;
                Ok(None)
            })
            .await?;

        if let Err(e) = self
            .users
            .update_companion_status(order.companion_id, COMPANION_BUSY)
            .await
        {
            tracing::warn!(companion_id = %order.companion_id, error = %e, "cannot mark companion busy");
        }
        Ok(order)
    }

    /// Companion starts the session.
    #[tracing::instrument(skip(self))]
    pub async fn start_order(&self, cmd: OrderAction) -> Result<Order> {
        cmd.validate()?;
        self.update(cmd.order_id, |order| {
            if !order.is_companion(cmd.operator_id) {
                return Err(OrderError::PermissionDenied("only the companion can start the order"));
            }
            order.start(Utc::now())?;
            Ok(None)
        })
        .await
    }

    /// Either participant finishes the session; the companion is paid
    /// when the wallet consumes `ORDER_COMPLETED`.
    #[tracing::instrument(skip(self))]
    pub async fn complete_order(&self, cmd: OrderAction) -> Result<Order> {
        cmd.validate()?;
        let order = self.load(cmd.order_id).await?;
        if !order.is_boss(cmd.operator_id) && !order.is_companion(cmd.operator_id) {
            return Err(OrderError::PermissionDenied("only participants can complete the order"));
        }
        if !order.status.can_complete() {
            return Err(OrderError::transition(order.status, "complete"));
        }

        let result = self
            .publish(&OrderEvent::OrderCompleted(order.completed_event()), &order.order_no)
            .await?;
        self.settled(order.id, result, |o| {
            matches!(o.status, OrderStatus::Completed | OrderStatus::Rated)
        })
        .await
    }

    /// Cancels an order. Before acceptance only the boss may cancel, after
    /// it only the companion. A paid order is refunded by the wallet.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(&self, cmd: CancelOrder) -> Result<Order> {
        cmd.action().validate()?;
        let order = self.load(cmd.order_id).await?;
        self.request_cancel(order, cmd).await
    }

    /// Publishes the cancel of `order` as read by the caller. The local
    /// transaction only applies it while the row still has that status;
    /// if it moved on, the operator is checked again against the new one.
    async fn request_cancel(&self, mut order: Order, cmd: CancelOrder) -> Result<Order> {
        check_cancel(&order, cmd.operator_id)?;

        let need_refund = order.status.owes_refund();
        order.cancel_reason = cmd.reason;
        let message = self
            .message(&OrderEvent::OrderCancelled(order.cancelled_event(need_refund)), &order.order_no)?
            .property(EXPECTED_STATUS_PROPERTY, order.status.as_str())
            .build()?;
        let result = self.publisher.publish(message).await?;
        let rolled_back = result.state == LocalTransactionState::Rollback;
        match self.settled(order.id, result, |o| o.status.is_cancelled()).await {
            Err(e) if rolled_back => {
                let current = self.load(order.id).await?;
                check_cancel(&current, cmd.operator_id)?;
                Err(e)
            }
            settled => settled,
        }
    }

    /// Boss rates a completed order.
    #[tracing::instrument(skip(self))]
    pub async fn rate_order(&self, cmd: RateOrder) -> Result<Order> {
        cmd.validate()?;
        let rating = cmd.rating;
        let order = self
            .update(cmd.order_id, |order| {
                if !order.is_boss(cmd.operator_id) {
                    return Err(OrderError::PermissionDenied("only the boss can rate the order"));
                }
                order.rate(rating, cmd.comment, Utc::now())?;
                Ok(None)
            })
            .await?;

        if let Err(e) = self
            .users
            .update_companion_stats(order.companion_id, f64::from(rating), 1)
            .await
        {
            tracing::warn!(companion_id = %order.companion_id, error = %e, "cannot update companion stats");
        }
        Ok(order)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        if order_id.is_zero() {
            return Err(OrderError::InvalidArgument("order_id is required"));
        }
        self.load(order_id).await
    }

    /// Orders of a user in either role, newest first.
    pub async fn list_orders(&self, user_id: UserId, limit: Option<usize>) -> Result<Vec<Order>> {
        if user_id.is_zero() {
            return Err(OrderError::InvalidArgument("user_id is required"));
        }
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list_by_user(user_id, limit).await?)
    }

    async fn load(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .find_by_id(order_id)
            .await?
            .ok_or(OrderError::NotFound("order"))
    }

    /// Locks the order, applies `f`, saves it together with the outbox
    /// row `f` returns, and commits.
    async fn update<F>(&self, order_id: OrderId, f: F) -> Result<Order>
    where
        F: FnOnce(&mut Order) -> Result<Option<NewOutboxEvent>> + Send,
    {
        let mut tx = self.store.begin().await?;
        let staged = async {
            let mut order = tx.lock_by_id(order_id).await?.ok_or(OrderError::NotFound("order"))?;
            let before = order.status;
            let outbox = f(&mut order)?;
            tx.save_order(&order).await?;
            if let Some(event) = outbox {
                tx.insert_outbox(&event).await?;
            }
            Ok::<_, OrderError>((before, order))
        }
        .await;

        match staged {
            Ok((before, order)) => {
                tx.commit().await?;
                if order.status != before {
                    record_transition(order.status);
                }
                Ok(order)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    fn message(&self, event: &OrderEvent, order_no: &str) -> Result<MessageBuilder> {
        let body = event.to_body().map_err(StoreError::from)?;
        Ok(Message::for_event(event.tag()).key(order_no).body(body))
    }

    async fn publish(&self, event: &OrderEvent, order_no: &str) -> Result<TransactionSendResult> {
        let message = self.message(event, order_no)?.build()?;
        Ok(self.publisher.publish(message).await?)
    }

    /// Reads the order back after a transactional publish.
    async fn settled(
        &self,
        order_id: OrderId,
        result: TransactionSendResult,
        reached: impl Fn(&Order) -> bool,
    ) -> Result<Order> {
        let order = self.load(order_id).await?;
        if reached(&order) {
            return Ok(order);
        }
        match result.state {
            LocalTransactionState::Rollback => Err(OrderError::FailedPrecondition(
                "order status changed, please refresh and retry".to_string(),
            )),
            _ => {
                tracing::error!(order_no = %order.order_no, state = %result.state, "transition not visible after publish");
                Err(OrderError::Internal("order transition was not applied"))
            }
        }
    }
}

/// Who may cancel depends on how far the order got.
fn check_cancel(order: &Order, operator_id: UserId) -> Result<()> {
    match order.status {
        OrderStatus::Created | OrderStatus::Paid if !order.is_boss(operator_id) => Err(OrderError::PermissionDenied(
            "only the boss can cancel an order that has not been accepted",
        )),
        OrderStatus::Accepted if !order.is_companion(operator_id) => {
            Err(OrderError::PermissionDenied("only the companion can cancel an accepted order"))
        }
        status if !status.can_cancel() => Err(OrderError::transition(status, "cancel")),
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use broker::{CheckBackOptions, InMemoryBroker};

    use super::*;
    use crate::client::{ClientError, CompanionInfo};
    use crate::listener::OrderTransactionListener;
    use crate::memory::InMemoryOrderStore;

    pub(crate) const BOSS: UserId = UserId::new(1001);
    pub(crate) const COMPANION: UserId = UserId::new(2001);

    /// Scripted user service.
    #[derive(Default)]
    pub(crate) struct FakeUsers {
        pub balance: Mutex<Option<i64>>,
        pub consume_error: Mutex<Option<ClientError>>,
        pub consumed: Mutex<Vec<(UserId, i64, String)>>,
        pub statuses: Mutex<Vec<(UserId, i16)>>,
        pub ratings: Mutex<Vec<(UserId, f64)>>,
    }

    impl FakeUsers {
        pub(crate) fn with_balance(balance: i64) -> Arc<Self> {
            Arc::new(Self {
                balance: Mutex::new(Some(balance)),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl UserClient for FakeUsers {
        async fn get_companion(&self, user_id: UserId) -> std::result::Result<CompanionInfo, ClientError> {
            if user_id != COMPANION {
                return Err(ClientError::new(ErrorCode::NotFound, "companion not found"));
            }
            Ok(CompanionInfo {
                user_id,
                price_per_hour: 200,
                status: 1,
            })
        }

        async fn get_balance(&self, _user_id: UserId) -> std::result::Result<i64, ClientError> {
            self.balance
                .lock()
                .unwrap()
                .ok_or_else(|| ClientError::new(ErrorCode::NotFound, "wallet not found"))
        }

        async fn consume(
            &self,
            user_id: UserId,
            amount: i64,
            biz_order_id: &str,
            _remark: &str,
        ) -> std::result::Result<(), ClientError> {
            if let Some(e) = self.consume_error.lock().unwrap().clone() {
                return Err(e);
            }
            self.consumed.lock().unwrap().push((user_id, amount, biz_order_id.to_string()));
            Ok(())
        }

        async fn update_companion_status(&self, user_id: UserId, status: i16) -> std::result::Result<(), ClientError> {
            self.statuses.lock().unwrap().push((user_id, status));
            Ok(())
        }

        async fn update_companion_stats(
            &self,
            user_id: UserId,
            rating: f64,
            _delta_orders: i64,
        ) -> std::result::Result<(), ClientError> {
            self.ratings.lock().unwrap().push((user_id, rating));
            Ok(())
        }
    }

    pub(crate) struct Fixture {
        pub store: InMemoryOrderStore,
        pub broker: InMemoryBroker,
        pub users: Arc<FakeUsers>,
        pub service: OrderService<InMemoryOrderStore>,
    }

    pub(crate) fn fixture(users: Arc<FakeUsers>) -> Fixture {
        let store = InMemoryOrderStore::new();
        let broker = InMemoryBroker::new();
        let publisher = TransactionalPublisher::new(
            Arc::new(broker.clone()),
            crate::PRODUCER_GROUP,
            Arc::new(OrderTransactionListener::new(store.clone())),
            CheckBackOptions::default(),
        );
        Fixture {
            service: OrderService::new(store.clone(), users.clone(), publisher),
            store,
            broker,
            users,
        }
    }

    /// Places a 90-minute order (300 at 200/h) and marks it paid.
    pub(crate) async fn paid_order(f: &Fixture) -> Order {
        let order = f
            .service
            .create_order(CreateOrder::new(BOSS, COMPANION, 90).with_settlement(Settlement::Direct))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        order
    }

    #[tokio::test]
    async fn test_deferred_create_publishes_payment_pending() {
        let f = fixture(FakeUsers::with_balance(1_000));

        let order = f
            .service
            .create_order(CreateOrder::new(BOSS, COMPANION, 90).with_game("chess", "blitz"))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Created);
        assert_eq!(order.total_amount, 300);
        assert_eq!(order.price_per_hour, 200);
        let published = f.broker.published_with_tag("PAYMENT_PENDING").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key.as_deref(), Some(order.order_no.as_str()));
        assert!(f.users.consumed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_insufficient_balance() {
        let f = fixture(FakeUsers::with_balance(299));

        let err = f
            .service
            .create_order(CreateOrder::new(BOSS, COMPANION, 90))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert!(f.broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_without_wallet_is_failed_precondition() {
        let f = fixture(Arc::new(FakeUsers::default()));

        let err = f
            .service
            .create_order(CreateOrder::new(BOSS, COMPANION, 90))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert_eq!(err.to_string(), "wallet not found, please create wallet first");
    }

    #[tokio::test]
    async fn test_create_with_unknown_companion() {
        let f = fixture(FakeUsers::with_balance(1_000));

        let err = f
            .service
            .create_order(CreateOrder::new(BOSS, UserId::new(3), 90))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_create_rejects_zero_duration() {
        let f = fixture(FakeUsers::with_balance(1_000));

        let err = f
            .service
            .create_order(CreateOrder::new(BOSS, COMPANION, 0))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_direct_create_debits_and_pays() {
        let f = fixture(FakeUsers::with_balance(1_000));

        let order = paid_order(&f).await;

        assert!(order.paid_at.is_some());
        let consumed = f.users.consumed.lock().unwrap().clone();
        assert_eq!(consumed, vec![(BOSS, 300, order.order_no.clone())]);
        assert!(f.broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_direct_create_refused_debit_cancels() {
        let users = FakeUsers::with_balance(1_000);
        *users.consume_error.lock().unwrap() =
            Some(ClientError::new(ErrorCode::ResourceExhausted, "insufficient balance"));
        let f = fixture(users);

        let err = f
            .service
            .create_order(CreateOrder::new(BOSS, COMPANION, 90).with_settlement(Settlement::Direct))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        let orders = f.store.list_by_user(BOSS, 10).await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
        assert_eq!(orders[0].cancel_reason, "payment failed: insufficient balance");
        assert!(f.store.outbox_rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_direct_create_debit_in_doubt_requests_refund() {
        let users = FakeUsers::with_balance(1_000);
        *users.consume_error.lock().unwrap() = Some(ClientError::new(ErrorCode::Internal, "timeout"));
        let f = fixture(users);

        let err = f
            .service
            .create_order(CreateOrder::new(BOSS, COMPANION, 90).with_settlement(Settlement::Direct))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Internal);
        let rows = f.store.outbox_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "ORDER_CANCELLED");
        assert!(rows[0].payload.contains("\"need_refund\":true"));
    }

    #[tokio::test]
    async fn test_accept_and_start_by_companion_only() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;

        let err = f.service.accept_order(OrderAction::new(order.id, BOSS)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        let accepted = f.service.accept_order(OrderAction::new(order.id, COMPANION)).await.unwrap();
        assert_eq!(accepted.status, OrderStatus::Accepted);
        assert_eq!(f.users.statuses.lock().unwrap().clone(), vec![(COMPANION, COMPANION_BUSY)]);

        let started = f.service.start_order(OrderAction::new(order.id, COMPANION)).await.unwrap();
        assert_eq!(started.status, OrderStatus::InService);
        assert!(started.start_at.is_some());
    }

    #[tokio::test]
    async fn test_accept_unpaid_order_fails() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = f.service.create_order(CreateOrder::new(BOSS, COMPANION, 90)).await.unwrap();

        let err = f.service.accept_order(OrderAction::new(order.id, COMPANION)).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert_eq!(f.service.get_order(order.id).await.unwrap().status, OrderStatus::Created);
    }

    #[tokio::test]
    async fn test_complete_publishes_and_updates() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;
        f.service.accept_order(OrderAction::new(order.id, COMPANION)).await.unwrap();

        let completed = f.service.complete_order(OrderAction::new(order.id, BOSS)).await.unwrap();

        assert_eq!(completed.status, OrderStatus::Completed);
        assert_eq!(f.broker.published_with_tag("ORDER_COMPLETED").await.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_by_stranger_is_denied() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;
        f.service.accept_order(OrderAction::new(order.id, COMPANION)).await.unwrap();

        let err = f
            .service
            .complete_order(OrderAction::new(order.id, UserId::new(9)))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::PermissionDenied);
        assert!(f.broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_paid_order_by_boss_awaits_refund() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;

        let err = f
            .service
            .cancel_order(CancelOrder::new(order.id, COMPANION, "busy"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        let cancelled = f
            .service
            .cancel_order(CancelOrder::new(order.id, BOSS, "changed my mind"))
            .await
            .unwrap();

        assert_eq!(cancelled.status, OrderStatus::CancelRefunding);
        let published = f.broker.published_with_tag("ORDER_CANCELLED").await;
        assert_eq!(published.len(), 1);
        assert!(published[0].body_str().unwrap().contains("\"need_refund\":true"));
    }

    #[tokio::test]
    async fn test_cancel_accepted_order_by_companion_only() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;
        f.service.accept_order(OrderAction::new(order.id, COMPANION)).await.unwrap();

        let err = f
            .service
            .cancel_order(CancelOrder::new(order.id, BOSS, ""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        let cancelled = f
            .service
            .cancel_order(CancelOrder::new(order.id, COMPANION, "emergency"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::CancelRefunding);
    }

    #[tokio::test]
    async fn test_boss_cancel_overtaken_by_accept_is_denied() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;
        let stale = f.service.get_order(order.id).await.unwrap();
        f.service.accept_order(OrderAction::new(order.id, COMPANION)).await.unwrap();

        let err = f
            .service
            .request_cancel(stale, CancelOrder::new(order.id, BOSS, "changed my mind"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::PermissionDenied);
        assert_eq!(f.store.find_by_id(order.id).await.unwrap().unwrap().status, OrderStatus::Accepted);
        assert!(f.broker.published_with_tag("ORDER_CANCELLED").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_carries_expected_status() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;

        f.service
            .cancel_order(CancelOrder::new(order.id, BOSS, "changed my mind"))
            .await
            .unwrap();

        let published = f.broker.published_with_tag("ORDER_CANCELLED").await;
        assert_eq!(published[0].property(EXPECTED_STATUS_PROPERTY), Some("PAID"));
    }

    #[tokio::test]
    async fn test_cancel_created_order_needs_no_refund() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = f.service.create_order(CreateOrder::new(BOSS, COMPANION, 90)).await.unwrap();

        let cancelled = f
            .service
            .cancel_order(CancelOrder::new(order.id, BOSS, "too slow"))
            .await
            .unwrap();

        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        let published = f.broker.published_with_tag("ORDER_CANCELLED").await;
        assert!(published[0].body_str().unwrap().contains("\"need_refund\":false"));
    }

    #[tokio::test]
    async fn test_cancel_in_service_fails() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;
        f.service.accept_order(OrderAction::new(order.id, COMPANION)).await.unwrap();
        f.service.start_order(OrderAction::new(order.id, COMPANION)).await.unwrap();

        let err = f
            .service
            .cancel_order(CancelOrder::new(order.id, COMPANION, ""))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_rate_once() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let order = paid_order(&f).await;
        f.service.accept_order(OrderAction::new(order.id, COMPANION)).await.unwrap();
        f.service.complete_order(OrderAction::new(order.id, COMPANION)).await.unwrap();

        let rated = f
            .service
            .rate_order(RateOrder::new(order.id, BOSS, 5, "great"))
            .await
            .unwrap();
        assert_eq!(rated.status, OrderStatus::Rated);
        assert_eq!(rated.rating, Some(5));
        assert_eq!(f.users.ratings.lock().unwrap().clone(), vec![(COMPANION, 5.0)]);

        let err = f
            .service
            .rate_order(RateOrder::new(order.id, BOSS, 4, ""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let f = fixture(FakeUsers::with_balance(1_000));
        let first = f.service.create_order(CreateOrder::new(BOSS, COMPANION, 60)).await.unwrap();
        let second = f.service.create_order(CreateOrder::new(BOSS, COMPANION, 30)).await.unwrap();

        assert_eq!(f.service.get_order(first.id).await.unwrap(), first);
        assert_eq!(
            f.service.get_order(OrderId::new(999)).await.unwrap_err().code(),
            ErrorCode::NotFound
        );

        let listed = f.service.list_orders(COMPANION, None).await.unwrap();
        assert_eq!(listed.iter().map(|o| o.id).collect::<Vec<_>>(), vec![second.id, first.id]);
    }
}
