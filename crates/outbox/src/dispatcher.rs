//! Background publisher for outbox rows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::{Message, MessageBroker};
use tokio::sync::watch;

use crate::{OutboxEvent, OutboxStore, Result};

/// Dispatcher settings for one service.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Service name used in logs and metrics.
    pub service: String,
    /// Topic every row is published to; the row's event type becomes the tag.
    pub topic: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Publish attempts per row before it is left FAILED for an operator.
    pub max_attempts: u32,
}

impl DispatcherConfig {
    pub fn new(service: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            topic: topic.into(),
            poll_interval: Duration::from_secs(2),
            batch_size: 50,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.sent == 0 && self.failed == 0
    }
}

/// Polls an [`OutboxStore`] and publishes what it finds.
///
/// One dispatcher runs per service. Rows are sent in creation order and a
/// failed row never blocks the rest of its batch.
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn OutboxStore>, broker: Arc<dyn MessageBroker>, config: DispatcherConfig) -> Self {
        Self { store, broker, config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Publishes one batch.
    #[tracing::instrument(skip(self), fields(service = %self.config.service))]
    pub async fn dispatch_once(&self) -> Result<DispatchReport> {
        let started = Instant::now();
        let batch = self
            .store
            .fetch_dispatchable(self.config.batch_size, self.config.max_attempts)
            .await?;

        let mut report = DispatchReport::default();
        for event in batch {
            if self.dispatch_event(&event).await? {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }

        metrics::histogram!("outbox_dispatch_batch_seconds").record(started.elapsed().as_secs_f64());
        if !report.is_empty() {
            tracing::debug!(sent = report.sent, failed = report.failed, "outbox batch dispatched");
        }
        Ok(report)
    }

    /// Returns whether the row was sent. Store errors abort the batch;
    /// publish errors are recorded on the row.
    async fn dispatch_event(&self, event: &OutboxEvent) -> Result<bool> {
        let service = self.config.service.clone();
        let attempts = event.attempts + 1;

        if event.payload.trim().is_empty() {
            tracing::warn!(id = event.id, event_type = %event.event_type, "outbox row has empty payload");
            self.store
                .mark_failed(event.id, "empty payload", self.config.max_attempts as i32)
                .await?;
            metrics::counter!("outbox_events_dispatched_total", "service" => service, "outcome" => "exhausted")
                .increment(1);
            return Ok(false);
        }

        let message = Message::builder()
            .topic(self.config.topic.as_str())
            .tag(event.event_type.as_str())
            .key(format!("{}-outbox-{}", self.config.service, event.id))
            .property("outbox_id", event.id.to_string())
            .body(event.payload.as_bytes())
            .build();

        let sent = match message {
            Ok(message) => self.broker.send(message).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(receipt) => {
                if let Err(e) = self.store.mark_sent(event.id, attempts).await {
                    tracing::warn!(
                        id = event.id,
                        event_type = %event.event_type,
                        message_id = %receipt.message_id,
                        error = %e,
                        "outbox row published but not marked sent; it will be sent again and consumers must dedupe it"
                    );
                    return Err(e);
                }
                metrics::counter!("outbox_events_dispatched_total", "service" => service, "outcome" => "sent")
                    .increment(1);
                tracing::debug!(id = event.id, event_type = %event.event_type, message_id = %receipt.message_id, "outbox row sent");
                Ok(true)
            }
            Err(e) => {
                let error = e.to_string();
                self.store.mark_failed(event.id, &error, attempts).await?;
                let outcome = if attempts as u32 >= self.config.max_attempts {
                    tracing::error!(id = event.id, event_type = %event.event_type, attempts, error = %error, "outbox row exhausted its attempts");
                    "exhausted"
                } else {
                    tracing::warn!(id = event.id, event_type = %event.event_type, attempts, error = %error, "outbox publish failed");
                    "failed"
                };
                metrics::counter!("outbox_events_dispatched_total", "service" => service, "outcome" => outcome)
                    .increment(1);
                Ok(false)
            }
        }
    }

    /// Polls until `shutdown` flips to true. A batch in progress always
    /// finishes; the signal is only observed between batches.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            service = %self.config.service,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox dispatcher started"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_once().await {
                        tracing::error!(service = %self.config.service, error = %e, "outbox poll failed");
                    }
                }
            }
        }

        tracing::info!(service = %self.config.service, "outbox dispatcher stopped");
    }
}
