use async_trait::async_trait;
use common::{OrderId, UserId};
use outbox::{NewOutboxEvent, Result};

use crate::model::{NewOrder, Order};

/// Persistence of the order service.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn OrderTx>>;

    /// Allocates an order id ahead of the insert.
    async fn next_order_id(&self) -> Result<OrderId>;

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>>;

    async fn find_by_order_no(&self, order_no: &str) -> Result<Option<Order>>;

    /// Orders where the user is boss or companion, newest first.
    async fn list_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Order>>;
}

/// An open local transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait OrderTx: Send {
    /// A repeated `order_no` fails with [`outbox::StoreError::Duplicate`].
    async fn insert_order(&mut self, new: &NewOrder) -> Result<Order>;

    async fn lock_by_id(&mut self, id: OrderId) -> Result<Option<Order>>;

    async fn lock_by_order_no(&mut self, order_no: &str) -> Result<Option<Order>>;

    /// Writes back every mutable column of a locked order.
    async fn save_order(&mut self, order: &Order) -> Result<()>;

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Locks an order by number, falling back to the id for events that
/// carry only one of them.
pub(crate) async fn lock_order(tx: &mut dyn OrderTx, order_no: &str, id: OrderId) -> Result<Option<Order>> {
    if !order_no.is_empty()
        && let Some(order) = tx.lock_by_order_no(order_no).await?
    {
        return Ok(Some(order));
    }
    if id.is_zero() {
        return Ok(None);
    }
    tx.lock_by_id(id).await
}

/// Committed-state counterpart of [`lock_order`].
pub(crate) async fn find_order<S: OrderStore + ?Sized>(store: &S, order_no: &str, id: OrderId) -> Result<Option<Order>> {
    if !order_no.is_empty()
        && let Some(order) = store.find_by_order_no(order_no).await?
    {
        return Ok(Some(order));
    }
    if id.is_zero() {
        return Ok(None);
    }
    store.find_by_id(id).await
}
