//! Consumer loop with redelivery and dead-lettering.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::{Delivery, Message, Subscription};

/// What the handler wants the broker to do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Handled: applied, already applied, or deliberately dropped.
    Success,
    /// A transient failure; deliver again later.
    Retry(String),
}

/// Applies the local effects of one message.
///
/// Implementations decide what is transient. Malformed payloads and
/// precondition mismatches are `Success`, never `Retry`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Consumer name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn handle(&self, message: &Message) -> ConsumeOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Deliveries before a message is dead-lettered, including the first.
    pub max_attempts: u32,
    /// Delay before a retried message re-enters the queue in [`Consumer::run`].
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Binds a subscription to its handler.
pub struct Consumer {
    subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
}

impl Consumer {
    pub fn new(subscription: Subscription, handler: Arc<dyn MessageHandler>, policy: RetryPolicy) -> Self {
        Self {
            subscription,
            handler,
            policy,
        }
    }

    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    /// Handles one delivery. Returns the delivery when it should be retried.
    async fn process(&self, delivery: Delivery) -> Option<Delivery> {
        let name = self.handler.name();
        let outcome = self.handler.handle(&delivery.message).await;

        match outcome {
            ConsumeOutcome::Success => {
                metrics::counter!("consumer_messages_total", "consumer" => name, "outcome" => "success").increment(1);
                None
            }
            ConsumeOutcome::Retry(reason) if delivery.attempt < self.policy.max_attempts => {
                metrics::counter!("consumer_messages_total", "consumer" => name, "outcome" => "retry").increment(1);
                tracing::warn!(
                    consumer = name,
                    message_id = %delivery.message.id,
                    tag = %delivery.message.tag,
                    attempt = delivery.attempt,
                    %reason,
                    "message will be redelivered"
                );
                Some(delivery)
            }
            ConsumeOutcome::Retry(reason) => {
                metrics::counter!("consumer_messages_total", "consumer" => name, "outcome" => "dead_letter").increment(1);
                tracing::error!(
                    consumer = name,
                    message_id = %delivery.message.id,
                    tag = %delivery.message.tag,
                    attempt = delivery.attempt,
                    %reason,
                    "retries exhausted, message dead-lettered"
                );
                self.subscription.dead_letter(delivery).await;
                None
            }
        }
    }

    /// Processes everything currently queued, redelivering retries
    /// immediately. Returns the number of deliveries handled.
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Some(delivery) = self.subscription.try_recv() {
            handled += 1;
            if let Some(retry) = self.process(delivery).await {
                self.subscription.redeliver(retry);
            }
        }
        handled
    }

    /// Consumes until `shutdown` flips to true. A delivery in progress
    /// finishes before the loop exits. Retries wait out the backoff inside
    /// the loop; any still waiting at shutdown are dead-lettered so the
    /// broker keeps them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let name = self.handler.name();
        tracing::info!(consumer = name, topic = %self.subscription.topic(), "consumer started");

        let mut retries: VecDeque<(Instant, Delivery)> = VecDeque::new();
        loop {
            let next_due = retries.front().map(|(due, _)| *due);
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                () = time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    if let Some((_, retry)) = retries.pop_front() {
                        self.subscription.redeliver(retry);
                    }
                }

                delivery = self.subscription.recv() => {
                    let Some(delivery) = delivery else {
                        tracing::warn!(consumer = name, "subscription closed");
                        break;
                    };

                    if let Some(retry) = self.process(delivery).await {
                        retries.push_back((Instant::now() + self.policy.backoff, retry));
                    }
                }
            }
        }

        if !retries.is_empty() {
            tracing::warn!(consumer = name, pending = retries.len(), "retries still waiting at shutdown, dead-lettered");
        }
        for (_, retry) in retries {
            self.subscription.dead_letter(retry).await;
        }
        tracing::info!(consumer = name, "consumer stopped");
    }
}
