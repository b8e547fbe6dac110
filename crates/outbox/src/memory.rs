use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{NewOutboxEvent, OutboxEvent, OutboxStatus, OutboxStore, ProcessedMessage, Result, StoreError};

/// In-memory outbox table. Service stores embed it in their own state so
/// that outbox inserts share the business transaction.
#[derive(Debug, Clone, Default)]
pub struct OutboxTable {
    rows: Vec<OutboxEvent>,
    next_id: i64,
}

impl OutboxTable {
    pub fn insert(&mut self, new: NewOutboxEvent) -> OutboxEvent {
        self.next_id += 1;
        let now = Utc::now();
        let row = OutboxEvent {
            id: self.next_id,
            event_type: new.event_type,
            payload: new.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.push(row.clone());
        row
    }

    pub fn fetch_dispatchable(&self, limit: usize, max_attempts: u32) -> Vec<OutboxEvent> {
        // Rows are appended in creation order.
        self.rows
            .iter()
            .filter(|r| r.is_dispatchable(max_attempts))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn mark_sent(&mut self, id: i64, attempts: i32) {
        if let Some(row) = self.rows.iter_mut().find(|r| r.id == id && r.status != OutboxStatus::Sent) {
            row.status = OutboxStatus::Sent;
            row.attempts = attempts;
            row.last_error = None;
            row.updated_at = Utc::now();
        }
    }

    pub fn mark_failed(&mut self, id: i64, error: &str, attempts: i32) {
        if let Some(row) = self.rows.iter_mut().find(|r| r.id == id && r.status != OutboxStatus::Sent) {
            row.status = OutboxStatus::Failed;
            row.attempts = attempts;
            row.last_error = Some(error.to_string());
            row.updated_at = Utc::now();
        }
    }

    pub fn get(&self, id: i64) -> Option<OutboxEvent> {
        self.rows.iter().find(|r| r.id == id).cloned()
    }

    pub fn rows(&self) -> &[OutboxEvent] {
        &self.rows
    }
}

/// In-memory processed-message markers with the unique `message_id` rule.
#[derive(Debug, Clone, Default)]
pub struct ProcessedTable {
    markers: HashMap<String, ProcessedMessage>,
}

impl ProcessedTable {
    pub fn contains(&self, message_id: &str) -> bool {
        self.markers.contains_key(message_id)
    }

    pub fn insert(&mut self, marker: ProcessedMessage) -> Result<()> {
        if self.markers.contains_key(&marker.message_id) {
            return Err(StoreError::Duplicate {
                constraint: "uk_processed_messages_message_id".to_string(),
            });
        }
        self.markers.insert(marker.message_id.clone(), marker);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Standalone in-memory outbox, for dispatcher tests and tools that only
/// need the outbox table.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    table: Arc<RwLock<OutboxTable>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, new: NewOutboxEvent) -> OutboxEvent {
        self.table.write().await.insert(new)
    }

    pub async fn all(&self) -> Vec<OutboxEvent> {
        self.table.read().await.rows().to_vec()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_dispatchable(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxEvent>> {
        Ok(self.table.read().await.fetch_dispatchable(limit, max_attempts))
    }

    async fn mark_sent(&self, id: i64, attempts: i32) -> Result<()> {
        self.table.write().await.mark_sent(id, attempts);
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str, attempts: i32) -> Result<()> {
        self.table.write().await.mark_failed(id, error, attempts);
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>> {
        Ok(self.table.read().await.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_is_oldest_first_and_bounded() {
        let mut table = OutboxTable::default();
        for i in 0..5 {
            table.insert(NewOutboxEvent::new("PAYMENT_SUCCEEDED", format!("{{\"n\":{i}}}")));
        }

        let batch = table.fetch_dispatchable(3, 10);

        assert_eq!(batch.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_sent_rows_are_final() {
        let mut table = OutboxTable::default();
        let row = table.insert(NewOutboxEvent::new("X", "{}"));

        table.mark_sent(row.id, 1);
        table.mark_failed(row.id, "late failure", 2);

        let stored = table.get(row.id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert_eq!(stored.last_error, None);
        assert!(table.fetch_dispatchable(10, 10).is_empty());
    }

    #[test]
    fn test_processed_marker_is_unique() {
        let mut table = ProcessedTable::default();
        table.insert(ProcessedMessage::new("m-1", "USER_FOLLOW")).unwrap();

        let err = table.insert(ProcessedMessage::new("m-1", "USER_FOLLOW")).unwrap_err();

        assert!(err.is_duplicate());
        assert!(table.contains("m-1"));
        assert_eq!(table.len(), 1);
    }
}
