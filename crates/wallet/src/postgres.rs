use async_trait::async_trait;
use common::UserId;
use outbox::postgres::{insert_event, insert_processed, processed_exists};
use outbox::{NewOutboxEvent, OutboxEvent, OutboxStore, PostgresOutboxStore, ProcessedMessage, Result, StoreError};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::model::{
    CompanionProfile, CompanionStatus, NewWalletTransaction, TransactionKind, UserStats, Wallet, WalletTransaction,
};
use crate::store::{UserStore, UserTx};

const WALLET_COLUMNS: &str = "id, user_id, balance, frozen_balance, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, user_id, wallet_id, change_amount, before_balance, after_balance, type, biz_order_id, remark, created_at";
const COMPANION_COLUMNS: &str = "user_id, price_per_hour, status, rating, total_orders, updated_at";

/// PostgreSQL-backed user store.
#[derive(Clone)]
pub struct PostgresUserStore {
    pool: PgPool,
    outbox: PostgresOutboxStore,
}

impl PostgresUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: PostgresOutboxStore::new(pool.clone()),
            pool,
        }
    }

    /// Applies the user service schema.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations/wallet").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_wallet(row: PgRow) -> Result<Wallet> {
    Ok(Wallet {
        id: row.try_get("id")?,
        user_id: UserId::from_i64(row.try_get("user_id")?),
        balance: row.try_get("balance")?,
        frozen_balance: row.try_get("frozen_balance")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_transaction(row: PgRow) -> Result<WalletTransaction> {
    let kind: String = row.try_get("type")?;
    Ok(WalletTransaction {
        id: row.try_get("id")?,
        user_id: UserId::from_i64(row.try_get("user_id")?),
        wallet_id: row.try_get("wallet_id")?,
        change_amount: row.try_get("change_amount")?,
        before_balance: row.try_get("before_balance")?,
        after_balance: row.try_get("after_balance")?,
        kind: TransactionKind::parse(&kind)?,
        biz_order_id: row.try_get("biz_order_id")?,
        remark: row.try_get("remark")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_companion(row: PgRow) -> Result<CompanionProfile> {
    let status: i16 = row.try_get("status")?;
    Ok(CompanionProfile {
        user_id: UserId::from_i64(row.try_get("user_id")?),
        price_per_hour: row.try_get("price_per_hour")?,
        status: CompanionStatus::from_code(status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown companion status {status}")))?,
        rating: row.try_get("rating")?,
        total_orders: row.try_get("total_orders")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl UserStore for PostgresUserStore {
    async fn begin(&self) -> Result<Box<dyn UserTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUserTx { tx }))
    }

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<Wallet>> {
        let row = sqlx::query(&format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = $1"))
            .bind(user_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_wallet).transpose()
    }

    async fn find_transaction(&self, kind: TransactionKind, biz_order_id: &str) -> Result<Option<WalletTransaction>> {
        if biz_order_id.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE type = $1 AND biz_order_id = $2"
        ))
        .bind(kind.as_str())
        .bind(biz_order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_transaction).transpose()
    }

    async fn list_transactions(&self, user_id: UserId) -> Result<Vec<WalletTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE user_id = $1 ORDER BY id ASC"
        ))
        .bind(user_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_transaction).collect()
    }

    async fn find_companion(&self, user_id: UserId) -> Result<Option<CompanionProfile>> {
        let row = sqlx::query(&format!("SELECT {COMPANION_COLUMNS} FROM companion_profiles WHERE user_id = $1"))
            .bind(user_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_companion).transpose()
    }

    async fn find_stats(&self, user_id: UserId) -> Result<UserStats> {
        let row = sqlx::query("SELECT follower_count, following_count FROM user_stats WHERE user_id = $1")
            .bind(user_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(UserStats {
                user_id,
                follower_count: row.try_get("follower_count")?,
                following_count: row.try_get("following_count")?,
            }),
            None => Ok(UserStats::empty(user_id)),
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresUserStore {
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

struct PgUserTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UserTx for PgUserTx {
    async fn find_transaction(&mut self, kind: TransactionKind, biz_order_id: &str) -> Result<Option<WalletTransaction>> {
        if biz_order_id.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE type = $1 AND biz_order_id = $2"
        ))
        .bind(kind.as_str())
        .bind(biz_order_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(row_to_transaction).transpose()
    }

    async fn lock_wallet(&mut self, user_id: UserId) -> Result<Option<Wallet>> {
        let row = sqlx::query(&format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = $1 FOR UPDATE"))
            .bind(user_id.as_i64())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(row_to_wallet).transpose()
    }

    async fn create_wallet(&mut self, user_id: UserId) -> Result<Wallet> {
        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, balance, frozen_balance, created_at, updated_at)
            VALUES ($1, 0, 0, NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id.as_i64())
        .execute(&mut *self.tx)
        .await?;

        self.lock_wallet(user_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("wallet of user {user_id} missing after insert")))
    }

    async fn update_balance(&mut self, wallet_id: i64, balance: i64) -> Result<()> {
        sqlx::query("UPDATE wallets SET balance = $2, updated_at = NOW() WHERE id = $1")
            .bind(wallet_id)
            .bind(balance)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_transaction(&mut self, new: &NewWalletTransaction) -> Result<WalletTransaction> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO wallet_transactions
                (user_id, wallet_id, change_amount, before_balance, after_balance, type, biz_order_id, remark, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(new.user_id.as_i64())
        .bind(new.wallet_id)
        .bind(new.change_amount)
        .bind(new.before_balance)
        .bind(new.after_balance)
        .bind(new.kind.as_str())
        .bind(&new.biz_order_id)
        .bind(&new.remark)
        .fetch_one(&mut *self.tx)
        .await?;
        row_to_transaction(row)
    }

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64> {
        insert_event(&mut self.tx, event).await
    }

    async fn is_processed(&mut self, message_id: &str) -> Result<bool> {
        processed_exists(&mut self.tx, message_id).await
    }

    async fn mark_processed(&mut self, marker: &ProcessedMessage) -> Result<()> {
        insert_processed(&mut self.tx, marker).await
    }

    async fn lock_companion(&mut self, user_id: UserId) -> Result<Option<CompanionProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {COMPANION_COLUMNS} FROM companion_profiles WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(row_to_companion).transpose()
    }

    async fn save_companion(&mut self, profile: &CompanionProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO companion_profiles (user_id, price_per_hour, status, rating, total_orders, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE SET
                price_per_hour = EXCLUDED.price_per_hour,
                status = EXCLUDED.status,
                rating = EXCLUDED.rating,
                total_orders = EXCLUDED.total_orders,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(profile.user_id.as_i64())
        .bind(profile.price_per_hour)
        .bind(profile.status.code())
        .bind(profile.rating)
        .bind(profile.total_orders)
        .bind(profile.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn adjust_follow_counts(&mut self, follower: UserId, following: UserId, delta: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_stats (user_id, follower_count, following_count)
            VALUES ($1, GREATEST($2, 0), 0)
            ON CONFLICT (user_id) DO UPDATE
            SET follower_count = GREATEST(user_stats.follower_count + $2, 0)
            "#,
        )
        .bind(following.as_i64())
        .bind(delta)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_stats (user_id, follower_count, following_count)
            VALUES ($1, 0, GREATEST($2, 0))
            ON CONFLICT (user_id) DO UPDATE
            SET following_count = GREATEST(user_stats.following_count + $2, 0)
            "#,
        )
        .bind(follower.as_i64())
        .bind(delta)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
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
