use async_trait::async_trait;
use common::{OrderId, UserId};
use outbox::postgres::insert_event;
use outbox::{NewOutboxEvent, OutboxEvent, OutboxStore, PostgresOutboxStore, Result, StoreError};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::model::{NewOrder, Order};
use crate::state::OrderStatus;
use crate::store::{OrderStore, OrderTx};

const ORDER_COLUMNS: &str = "id, order_no, boss_id, companion_id, game_name, game_mode, duration_minutes, \
     price_per_hour, total_amount, status, paid_at, accepted_at, start_at, completed_at, cancelled_at, \
     rating, comment, cancel_reason, created_at, updated_at";

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
    outbox: PostgresOutboxStore,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: PostgresOutboxStore::new(pool.clone()),
            pool,
        }
    }

    /// Applies the order service schema.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations/order").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_order(row: PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: OrderId::from_i64(row.try_get("id")?),
        order_no: row.try_get("order_no")?,
        boss_id: UserId::from_i64(row.try_get("boss_id")?),
        companion_id: UserId::from_i64(row.try_get("companion_id")?),
        game_name: row.try_get("game_name")?,
        game_mode: row.try_get("game_mode")?,
        duration_minutes: row.try_get("duration_minutes")?,
        price_per_hour: row.try_get("price_per_hour")?,
        total_amount: row.try_get("total_amount")?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown order status {status}")))?,
        paid_at: row.try_get("paid_at")?,
        accepted_at: row.try_get("accepted_at")?,
        start_at: row.try_get("start_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        rating: row.try_get("rating")?,
        comment: row.try_get("comment")?,
        cancel_reason: row.try_get("cancel_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn begin(&self) -> Result<Box<dyn OrderTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgOrderTx { tx }))
    }

    async fn next_order_id(&self) -> Result<OrderId> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('orders_id_seq')")
            .fetch_one(&self.pool)
            .await?;
        Ok(OrderId::from_i64(id))
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_order).transpose()
    }

    async fn find_by_order_no(&self, order_no: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_no = $1"))
            .bind(order_no)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_order).transpose()
    }

    async fn list_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE boss_id = $1 OR companion_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(user_id.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_order).collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresOrderStore {
    async fn fetch_dispatchable(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxEvent>> {
        self.outbox.fetch_dispatchable(limit, max_attempts).await
    }

    async fn mark_sent(&self, id: i64, attempts: i32) -> Result<()> {
        self.outbox.mark_sent(id, attempts).await
    }

    async fn mark_failed(&self, id: i64, error: &str, attempts: i32) -> Result<()> {
        self.outbox.mark_failed(id, error, attempts).await
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>> {
        self.outbox.get(id).await
    }
}

struct PgOrderTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OrderTx for PgOrderTx {
    async fn insert_order(&mut self, new: &NewOrder) -> Result<Order> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO orders (id, order_no, boss_id, companion_id, game_name, game_mode, duration_minutes,
                                price_per_hour, total_amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(new.id.as_i64())
        .bind(&new.order_no)
        .bind(new.boss_id.as_i64())
        .bind(new.companion_id.as_i64())
        .bind(&new.game_name)
        .bind(&new.game_mode)
        .bind(new.duration_minutes)
        .bind(new.price_per_hour)
        .bind(new.total_amount)
        .bind(OrderStatus::Created.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        row_to_order(row)
    }

    async fn lock_by_id(&mut self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"))
            .bind(id.as_i64())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(row_to_order).transpose()
    }

    async fn lock_by_order_no(&mut self, order_no: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_no = $1 FOR UPDATE"))
            .bind(order_no)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(row_to_order).transpose()
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, paid_at = $3, accepted_at = $4, start_at = $5, completed_at = $6,
                cancelled_at = $7, rating = $8, comment = $9, cancel_reason = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(order.id.as_i64())
        .bind(order.status.as_str())
        .bind(order.paid_at)
        .bind(order.accepted_at)
        .bind(order.start_at)
        .bind(order.completed_at)
        .bind(order.cancelled_at)
        .bind(order.rating)
        .bind(&order.comment)
        .bind(&order.cancel_reason)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("order {} vanished", order.id)));
        }
        Ok(())
    }

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64> {
        insert_event(&mut self.tx, event).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
