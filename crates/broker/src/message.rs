use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::EventTag;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BrokerError, Result};

/// Identifier of a message, stable across redeliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Simple form is 32 chars, under the 64-char processed-message column.
        write!(f, "{}", self.0.simple())
    }
}

/// A message as seen by producers and consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    /// Event type; consumers filter and route on it.
    pub tag: String,
    /// Business key, e.g. the order number. Not used for deduplication by the broker.
    pub key: Option<String>,
    pub body: Vec<u8>,
    pub born_at: DateTime<Utc>,
    pub properties: HashMap<String, String>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Starts a builder for an event, deriving topic and tag from it.
    pub fn for_event(tag: EventTag) -> MessageBuilder {
        MessageBuilder::default().topic(tag.topic()).tag(tag.as_str())
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// Builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    topic: Option<String>,
    tag: Option<String>,
    key: Option<String>,
    body: Option<Vec<u8>>,
    properties: HashMap<String, String>,
}

impl MessageBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes a payload as the JSON body.
    pub fn json_body<T: Serialize>(mut self, payload: &T) -> std::result::Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_vec(payload)?);
        Ok(self)
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Message> {
        let topic = self.topic.ok_or(BrokerError::InvalidMessage("topic is required"))?;
        if topic.is_empty() {
            return Err(BrokerError::InvalidMessage("topic is required"));
        }
        Ok(Message {
            id: self.id.unwrap_or_default(),
            topic,
            tag: self.tag.unwrap_or_default(),
            key: self.key,
            body: self.body.unwrap_or_default(),
            born_at: Utc::now(),
            properties: self.properties,
        })
    }
}

/// One delivery attempt of a message to a consumer group.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Starts at 1 and grows with every redelivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn first(message: Message) -> Self {
        Self { message, attempt: 1 }
    }

    pub fn next_attempt(self) -> Self {
        Self {
            message: self.message,
            attempt: self.attempt + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_event_sets_topic_and_tag() {
        let msg = Message::for_event(EventTag::OrderCancelled)
            .key("20250101000001")
            .body("{}")
            .build()
            .unwrap();
        assert_eq!(msg.topic, "order_events");
        assert_eq!(msg.tag, "ORDER_CANCELLED");
        assert_eq!(msg.key.as_deref(), Some("20250101000001"));
        assert_eq!(msg.body_str(), Some("{}"));
    }

    #[test]
    fn test_build_requires_topic() {
        let err = Message::builder().tag("X").build().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidMessage(_)));
    }

    #[test]
    fn test_message_id_fits_processed_column() {
        assert!(MessageId::new().to_string().len() <= 64);
    }

    #[test]
    fn test_delivery_attempts_increase() {
        let msg = Message::builder().topic("t").build().unwrap();
        let delivery = Delivery::first(msg).next_attempt().next_attempt();
        assert_eq!(delivery.attempt, 3);
    }
}
