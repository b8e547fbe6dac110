use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};

use crate::{NewOutboxEvent, OutboxEvent, OutboxStatus, OutboxStore, ProcessedMessage, Result};

/// PostgreSQL-backed outbox. Both services use the same `outbox_events`
/// layout in their own database.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_event(row: PgRow) -> Result<OutboxEvent> {
        let status: String = row.try_get("status")?;
        Ok(OutboxEvent {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: OutboxStatus::parse(&status)?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Inserts an outbox row on the caller's transaction.
pub async fn insert_event(conn: &mut PgConnection, new: &NewOutboxEvent) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO outbox_events (event_type, payload, status, attempts, created_at, updated_at)
        VALUES ($1, $2, 'PENDING', 0, NOW(), NOW())
        RETURNING id
        "#,
    )
    .bind(&new.event_type)
    .bind(&new.payload)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

/// Whether a consumer already recorded this message.
pub async fn processed_exists(conn: &mut PgConnection, message_id: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1::BIGINT FROM processed_messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(conn)
            .await?;
    Ok(found.is_some())
}

/// Records a processed marker on the caller's transaction. A second
/// insert of the same id fails with [`crate::StoreError::Duplicate`].
pub async fn insert_processed(conn: &mut PgConnection, marker: &ProcessedMessage) -> Result<()> {
    sqlx::query(
        "INSERT INTO processed_messages (message_id, event_type, created_at) VALUES ($1, $2, $3)",
    )
    .bind(&marker.message_id)
    .bind(&marker.event_type)
    .bind(marker.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn fetch_dispatchable(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, payload, status, attempts, last_error, created_at, updated_at
            FROM outbox_events
            WHERE status IN ('PENDING', 'FAILED') AND attempts < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(max_attempts as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn mark_sent(&self, id: i64, attempts: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'SENT', attempts = $2, last_error = NULL, updated_at = NOW()
            WHERE id = $1 AND status <> 'SENT'
            "#,
        )
        .bind(id)
        .bind(attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str, attempts: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED', attempts = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1 AND status <> 'SENT'
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, event_type, payload, status, attempts, last_error, created_at, updated_at
            FROM outbox_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_event).transpose()
    }
}
