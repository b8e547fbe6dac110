use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};

use crate::{
    BrokerError, Delivery, HalfMessage, LocalTransactionState, Message, MessageBroker, MessageId,
    Result, SendReceipt, Subscription, TagFilter,
};

struct Route {
    topic: String,
    group: String,
    filter: TagFilter,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    routes: Vec<Route>,
    published: Vec<Message>,
    half: HashMap<MessageId, HalfMessage>,
    dead_letters: HashMap<String, Arc<Mutex<Vec<Delivery>>>>,
    unavailable: bool,
    lose_end_transaction: bool,
}

impl BrokerState {
    fn deliver(&mut self, message: Message) {
        self.routes.retain(|route| !route.tx.is_closed());
        for route in &self.routes {
            if route.topic == message.topic && route.filter.matches(&message.tag) {
                // A closed receiver is pruned on the next delivery.
                let _ = route.tx.send(Delivery::first(message.clone()));
            }
        }
        self.published.push(message);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(BrokerError::Unavailable("broker is not accepting requests".to_string()))
        } else {
            Ok(())
        }
    }
}

/// In-memory broker for tests and single-process deployments.
///
/// Each consumer group gets its own unbounded queue. Messages published
/// before a group subscribes are not replayed to it.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send and prepare fail until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Silently ignores end-transaction requests, as if the acknowledgement
    /// was lost in transit.
    pub async fn set_lose_end_transaction(&self, lose: bool) {
        self.state.lock().await.lose_end_transaction = lose;
    }

    /// Every message made visible so far, in publish order.
    pub async fn published(&self) -> Vec<Message> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_with_tag(&self, tag: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.tag == tag)
            .cloned()
            .collect()
    }

    pub async fn half_message_count(&self) -> usize {
        self.state.lock().await.half.len()
    }

    pub async fn dead_letters(&self, consumer_group: &str) -> Vec<Delivery> {
        let queue = self.state.lock().await.dead_letters.get(consumer_group).cloned();
        match queue {
            Some(queue) => queue.lock().await.clone(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn send(&self, message: Message) -> Result<SendReceipt> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let receipt = SendReceipt {
            message_id: message.id,
            topic: message.topic.clone(),
        };
        state.deliver(message);
        Ok(receipt)
    }

    async fn prepare(&self, producer_group: &str, message: Message) -> Result<MessageId> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let id = message.id;
        let now = Utc::now();
        state.half.insert(
            id,
            HalfMessage {
                message,
                producer_group: producer_group.to_string(),
                prepared_at: now,
                touched_at: now,
                checks: 0,
            },
        );
        Ok(id)
    }

    async fn end_transaction(&self, id: MessageId, outcome: LocalTransactionState) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.lose_end_transaction {
            return Ok(());
        }

        match outcome {
            LocalTransactionState::Commit => {
                let half = state.half.remove(&id).ok_or(BrokerError::UnknownHalfMessage(id))?;
                state.deliver(half.message);
            }
            LocalTransactionState::Rollback => {
                state.half.remove(&id).ok_or(BrokerError::UnknownHalfMessage(id))?;
            }
            LocalTransactionState::Unknown => {
                let half = state.half.get_mut(&id).ok_or(BrokerError::UnknownHalfMessage(id))?;
                half.checks += 1;
                half.touched_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn unresolved(&self, producer_group: &str, silence: Duration) -> Result<Vec<HalfMessage>> {
        let silence = chrono::Duration::from_std(silence).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let now = Utc::now();
        let state = self.state.lock().await;

        let mut pending: Vec<HalfMessage> = state
            .half
            .values()
            .filter(|h| h.producer_group == producer_group && now - h.touched_at >= silence)
            .cloned()
            .collect();
        pending.sort_by_key(|h| h.prepared_at);
        Ok(pending)
    }

    async fn subscribe(&self, topic: &str, consumer_group: &str, filter: TagFilter) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        if state
            .routes
            .iter()
            .any(|r| r.topic == topic && r.group == consumer_group && !r.tx.is_closed())
        {
            return Err(BrokerError::DuplicateSubscription {
                topic: topic.to_string(),
                group: consumer_group.to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let dead_letters = state
            .dead_letters
            .entry(consumer_group.to_string())
            .or_default()
            .clone();
        state.routes.push(Route {
            topic: topic.to_string(),
            group: consumer_group.to_string(),
            filter,
            tx: tx.clone(),
        });

        tracing::info!(topic, group = consumer_group, "subscription opened");
        Ok(Subscription::new(topic, consumer_group, rx, tx, dead_letters))
    }
}
