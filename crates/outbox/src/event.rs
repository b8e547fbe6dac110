use chrono::{DateTime, Utc};
use common::{EventTag, FollowEvent, OrderEvent};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Written by the business transaction, not yet published.
    #[default]
    Pending,
    /// Accepted by the broker. Never selected again.
    Sent,
    /// Last publish attempt failed. Retried while attempts remain.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENT" => Ok(OutboxStatus::Sent),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown outbox status {other}"))),
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    /// Broker tag the row is published with.
    pub event_type: String,
    /// Serialized JSON body.
    pub payload: String,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Whether the dispatcher should pick this row up.
    pub fn is_dispatchable(&self, max_attempts: u32) -> bool {
        self.status != OutboxStatus::Sent && (self.attempts.max(0) as u32) < max_attempts
    }
}

/// An outbox row about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub payload: String,
}

impl NewOutboxEvent {
    pub fn new(event_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }

    pub fn from_order_event(event: &OrderEvent) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event.tag().as_str(), event.to_body()?))
    }

    pub fn from_follow_event(event: &FollowEvent) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event.tag().as_str(), event.to_body()?))
    }

    pub fn tag(&self) -> Option<EventTag> {
        EventTag::parse(&self.event_type)
    }
}
