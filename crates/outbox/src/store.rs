use async_trait::async_trait;

use crate::{OutboxEvent, Result};

/// Dispatcher-side view of a service's outbox table.
///
/// Inserts are not part of this trait: they happen inside the owning
/// service's business transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` rows that are not SENT and have fewer than
    /// `max_attempts` attempts, oldest first.
    async fn fetch_dispatchable(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxEvent>>;

    /// Marks a row SENT, clearing `last_error`. A row already SENT is left untouched.
    async fn mark_sent(&self, id: i64, attempts: i32) -> Result<()>;

    /// Marks a row FAILED with the error text and the attempt count to record.
    async fn mark_failed(&self, id: i64, error: &str, attempts: i32) -> Result<()>;

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>>;
}
