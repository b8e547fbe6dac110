use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};

use crate::{Delivery, LocalTransactionState, Message, MessageId, Result};

/// Which tags of a topic a consumer group wants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TagFilter {
    #[default]
    All,
    Tags(Vec<String>),
}

impl TagFilter {
    /// Parses the `"A || B"` expression form; `"*"` or an empty string means all tags.
    pub fn parse(expr: &str) -> Self {
        let tags: Vec<String> = expr
            .split("||")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if tags.is_empty() || tags.iter().any(|t| t == "*") {
            TagFilter::All
        } else {
            TagFilter::Tags(tags)
        }
    }

    pub fn matches(&self, tag: &str) -> bool {
        match self {
            TagFilter::All => true,
            TagFilter::Tags(tags) => tags.iter().any(|t| t == tag),
        }
    }
}

/// Acknowledgement of a plain send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub topic: String,
}

/// A prepared message the broker holds invisible until the producer
/// commits or rolls it back.
#[derive(Debug, Clone)]
pub struct HalfMessage {
    pub message: Message,
    pub producer_group: String,
    pub prepared_at: DateTime<Utc>,
    /// Time of the last prepare or unresolved check. Check-back waits
    /// for silence measured from here.
    pub touched_at: DateTime<Utc>,
    pub checks: u32,
}

/// The operations producers and consumers need from a broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes a message that becomes visible to consumers immediately.
    async fn send(&self, message: Message) -> Result<SendReceipt>;

    /// Stores a half message on behalf of a producer group. It stays
    /// invisible until [`MessageBroker::end_transaction`] commits it.
    async fn prepare(&self, producer_group: &str, message: Message) -> Result<MessageId>;

    /// Resolves a half message. `Unknown` keeps it pending and counts a check.
    async fn end_transaction(&self, id: MessageId, state: LocalTransactionState) -> Result<()>;

    /// Half messages of a producer group that have been silent for at least `silence`.
    async fn unresolved(&self, producer_group: &str, silence: Duration) -> Result<Vec<HalfMessage>>;

    /// Opens a subscription for a consumer group on one topic.
    async fn subscribe(&self, topic: &str, consumer_group: &str, filter: TagFilter) -> Result<Subscription>;
}

/// Receiving end of a consumer group's queue.
///
/// Redelivery re-enters the same queue, so a retried message may be
/// overtaken by newer ones.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    group: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    requeue: mpsc::UnboundedSender<Delivery>,
    dead_letters: Arc<Mutex<Vec<Delivery>>>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Delivery>,
        requeue: mpsc::UnboundedSender<Delivery>,
        dead_letters: Arc<Mutex<Vec<Delivery>>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            rx,
            requeue,
            dead_letters,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Waits for the next delivery. `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Takes the next delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    pub fn redeliver(&self, delivery: Delivery) {
        if self.requeue.send(delivery.next_attempt()).is_err() {
            tracing::warn!(topic = %self.topic, group = %self.group, "redelivery dropped, queue closed");
        }
    }

    pub async fn dead_letter(&self, delivery: Delivery) {
        self.dead_letters.lock().await.push(delivery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_filter_parse() {
        assert_eq!(TagFilter::parse("*"), TagFilter::All);
        assert_eq!(TagFilter::parse(""), TagFilter::All);
        assert_eq!(
            TagFilter::parse("PAYMENT_SUCCEEDED || PAYMENT_FAILED"),
            TagFilter::Tags(vec!["PAYMENT_SUCCEEDED".into(), "PAYMENT_FAILED".into()])
        );
    }

    #[test]
    fn test_tag_filter_matches() {
        let filter = TagFilter::parse("USER_FOLLOW||USER_UNFOLLOW");
        assert!(filter.matches("USER_FOLLOW"));
        assert!(!filter.matches("PAYMENT_PENDING"));
        assert!(TagFilter::All.matches("anything"));
    }
}
