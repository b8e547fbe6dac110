use async_trait::async_trait;
use broker::{ConsumeOutcome, Message, MessageHandler};
use common::FollowEvent;
use outbox::{ProcessedMessage, StoreError};

use crate::service::rollback_quietly;
use crate::store::UserStore;

/// Maintains follower counters. Counter increments are not idempotent,
/// so every applied message leaves a processed marker in the same
/// transaction.
pub struct FollowConsumer<S> {
    store: S,
}

impl<S: UserStore> FollowConsumer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns false when the message had already been applied.
    async fn apply(&self, message_id: &str, event: FollowEvent) -> Result<bool, StoreError> {
        let delta = match event {
            FollowEvent::Follow(_) => 1,
            FollowEvent::Unfollow(_) => -1,
        };
        let payload = event.payload();

        let mut tx = self.store.begin().await?;
        let staged = async {
            if tx.is_processed(message_id).await? {
                return Ok(false);
            }
            tx.adjust_follow_counts(payload.follower_id, payload.following_id, delta)
                .await?;
            tx.mark_processed(&ProcessedMessage::new(message_id, event.tag().as_str()))
                .await?;
            Ok::<_, StoreError>(true)
        }
        .await;

        match staged {
            Ok(true) => {
                tx.commit().await?;
                Ok(true)
            }
            Ok(false) => {
                tx.rollback().await?;
                Ok(false)
            }
            // A concurrent delivery recorded the marker first.
            Err(e) if e.is_duplicate() => {
                rollback_quietly(tx).await;
                Ok(false)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S: UserStore + 'static> MessageHandler for FollowConsumer<S> {
    fn name(&self) -> &'static str {
        "wallet-follow-events"
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, tag = %message.tag))]
    async fn handle(&self, message: &Message) -> ConsumeOutcome {
        let event = match FollowEvent::decode(&message.tag, &message.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "poison message dropped");
                return ConsumeOutcome::Success;
            }
        };

        match self.apply(&message.id.to_string(), event).await {
            Ok(true) => ConsumeOutcome::Success,
            Ok(false) => {
                tracing::info!("follow event already applied");
                ConsumeOutcome::Success
            }
            Err(e) => ConsumeOutcome::Retry(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::{EventTag, FollowPayload, UserId};

    use super::*;
    use crate::memory::InMemoryUserStore;

    fn follow_message(tag: EventTag, follower: u64, following: u64) -> Message {
        Message::for_event(tag)
            .json_body(&FollowPayload {
                follower_id: UserId::new(follower),
                following_id: UserId::new(following),
            })
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_follow_counts_once_per_message() {
        let store = InMemoryUserStore::new();
        let consumer = FollowConsumer::new(store.clone());
        let msg = follow_message(EventTag::UserFollow, 1, 2);

        consumer.handle(&msg).await;
        consumer.handle(&msg).await;

        assert_eq!(store.find_stats(UserId::new(2)).await.unwrap().follower_count, 1);
        assert_eq!(store.find_stats(UserId::new(1)).await.unwrap().following_count, 1);
        assert_eq!(store.processed_count().await, 1);
    }

    #[tokio::test]
    async fn test_unfollow_decrements_and_floors() {
        let store = InMemoryUserStore::new();
        let consumer = FollowConsumer::new(store.clone());

        consumer.handle(&follow_message(EventTag::UserFollow, 1, 2)).await;
        consumer.handle(&follow_message(EventTag::UserUnfollow, 1, 2)).await;
        consumer.handle(&follow_message(EventTag::UserUnfollow, 1, 2)).await;

        let stats = store.find_stats(UserId::new(2)).await.unwrap();
        assert_eq!(stats.follower_count, 0);
        assert_eq!(store.processed_count().await, 3);
    }

    #[tokio::test]
    async fn test_self_follow_is_poison() {
        let store = InMemoryUserStore::new();
        let consumer = FollowConsumer::new(store.clone());

        let outcome = consumer.handle(&follow_message(EventTag::UserFollow, 3, 3)).await;

        assert_eq!(outcome, ConsumeOutcome::Success);
        assert_eq!(store.processed_count().await, 0);
    }

    #[tokio::test]
    async fn test_outage_is_retried_without_marker() {
        let store = InMemoryUserStore::new();
        let consumer = FollowConsumer::new(store.clone());
        store.set_unavailable(true);

        let outcome = consumer.handle(&follow_message(EventTag::UserFollow, 1, 2)).await;
        store.set_unavailable(false);

        assert!(matches!(outcome, ConsumeOutcome::Retry(_)));
        assert_eq!(store.processed_count().await, 0);
    }
}
