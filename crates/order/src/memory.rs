use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::{OrderId, UserId};
use outbox::{NewOutboxEvent, OutboxEvent, OutboxStore, OutboxTable, Result, StoreError};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{NewOrder, Order};
use crate::store::{OrderStore, OrderTx};

#[derive(Debug, Clone, Default)]
struct OrderTables {
    orders: BTreeMap<OrderId, Order>,
    outbox: OutboxTable,
}

impl OrderTables {
    fn by_order_no(&self, order_no: &str) -> Option<&Order> {
        self.orders.values().find(|o| o.order_no == order_no)
    }
}

/// In-memory order store with the same transaction model as the
/// in-memory user store: one transaction at a time, writes staged on a
/// copy until commit.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    tables: Arc<Mutex<OrderTables>>,
    // Like a database sequence, allocation survives rollbacks.
    sequence: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    pub async fn outbox_rows(&self) -> Vec<OutboxEvent> {
        self.tables.lock().await.outbox.rows().to_vec()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn begin(&self) -> Result<Box<dyn OrderTx>> {
        self.check_available()?;
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryOrderTx { guard, staged }))
    }

    async fn next_order_id(&self) -> Result<OrderId> {
        self.check_available()?;
        Ok(OrderId::new(self.sequence.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        self.check_available()?;
        Ok(self.tables.lock().await.orders.get(&id).cloned())
    }

    async fn find_by_order_no(&self, order_no: &str) -> Result<Option<Order>> {
        self.check_available()?;
        Ok(self.tables.lock().await.by_order_no(order_no).cloned())
    }

    async fn list_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Order>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .values()
            .rev()
            .filter(|o| o.boss_id == user_id || o.companion_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOrderStore {
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

struct InMemoryOrderTx {
    guard: OwnedMutexGuard<OrderTables>,
    staged: OrderTables,
}

#[async_trait]
impl OrderTx for InMemoryOrderTx {
    async fn insert_order(&mut self, new: &NewOrder) -> Result<Order> {
        if self.staged.by_order_no(&new.order_no).is_some() || self.staged.orders.contains_key(&new.id) {
            return Err(StoreError::Duplicate {
                constraint: "uk_orders_order_no".to_string(),
            });
        }
        let order = new.clone().into_order(Utc::now());
        self.staged.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn lock_by_id(&mut self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.staged.orders.get(&id).cloned())
    }

    async fn lock_by_order_no(&mut self, order_no: &str) -> Result<Option<Order>> {
        Ok(self.staged.by_order_no(order_no).cloned())
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        let row = self
            .staged
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| StoreError::Corrupt(format!("order {} vanished", order.id)))?;
        *row = order.clone();
        Ok(())
    }

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64> {
        Ok(self.staged.outbox.insert(event.clone()).id)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryOrderTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OrderStatus;

    fn new_order(id: OrderId, no: &str) -> NewOrder {
        NewOrder {
            id,
            order_no: no.to_string(),
            boss_id: UserId::new(1),
            companion_id: UserId::new(2),
            game_name: String::new(),
            game_mode: String::new(),
            duration_minutes: 60,
            price_per_hour: 100,
            total_amount: 100,
        }
    }

    #[tokio::test]
    async fn test_duplicate_order_no_is_rejected() {
        let store = InMemoryOrderStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&new_order(OrderId::new(1), "N-1")).await.unwrap();

        let err = tx.insert_order(&new_order(OrderId::new(2), "N-1")).await.unwrap_err();

        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_sequence_survives_rollback() {
        let store = InMemoryOrderStore::new();
        let first = store.next_order_id().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&new_order(first, "N-1")).await.unwrap();
        tx.rollback().await.unwrap();

        let second = store.next_order_id().await.unwrap();

        assert_ne!(first, second);
        assert!(store.find_by_id(first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_requires_existing_row() {
        let store = InMemoryOrderStore::new();
        let order = new_order(OrderId::new(9), "N-9").into_order(Utc::now());
        let mut tx = store.begin().await.unwrap();

        assert!(matches!(tx.save_order(&order).await, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_list_is_newest_first_for_both_roles() {
        let store = InMemoryOrderStore::new();
        let mut tx = store.begin().await.unwrap();
        for i in 1..=3 {
            tx.insert_order(&new_order(OrderId::new(i), &format!("N-{i}"))).await.unwrap();
        }
        tx.commit().await.unwrap();

        let as_boss = store.list_by_user(UserId::new(1), 2).await.unwrap();
        let as_companion = store.list_by_user(UserId::new(2), 10).await.unwrap();

        assert_eq!(as_boss.iter().map(|o| o.id.get()).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(as_companion.len(), 3);
        assert!(as_companion.iter().all(|o| o.status == OrderStatus::Created));
    }
}
