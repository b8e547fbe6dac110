//! Half-message (transactional) publishing.
//!
//! ```text
//! publish ──► prepare (invisible) ──► execute_local ──► end_transaction
//!                                         │
//!                         COMMIT: deliver │ ROLLBACK: discard │ UNKNOWN: keep
//!                                                                    │
//!             check_pending ◄── silence ≥ check_after ◄──────────────┘
//!                  │
//!                  └──► check_local (pure read) ──► end_transaction
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{Message, MessageBroker, MessageId, Result};

/// Outcome of a local transaction as reported to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalTransactionState {
    Commit,
    Rollback,
    Unknown,
}

impl LocalTransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalTransactionState::Commit => "COMMIT",
            LocalTransactionState::Rollback => "ROLLBACK",
            LocalTransactionState::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for LocalTransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local side of the half-message protocol.
///
/// Both methods may run more than once for the same message.
/// `execute_local` must be idempotent; `check_local` must only read.
#[async_trait]
pub trait TransactionListener: Send + Sync {
    /// Runs the local transaction the message announces.
    async fn execute_local(&self, message: &Message) -> LocalTransactionState;

    /// Re-derives the outcome of an earlier `execute_local` from committed state.
    async fn check_local(&self, message: &Message) -> LocalTransactionState;
}

/// Timing of broker check-backs.
#[derive(Debug, Clone, Copy)]
pub struct CheckBackOptions {
    /// Silence after which an unresolved half message is checked.
    pub check_after: Duration,
    /// How often [`TransactionalPublisher::run`] looks for unresolved messages.
    pub interval: Duration,
    /// Unresolved checks before the half message is discarded.
    pub max_checks: u32,
}

impl Default for CheckBackOptions {
    fn default() -> Self {
        Self {
            check_after: Duration::from_secs(6),
            interval: Duration::from_secs(5),
            max_checks: 15,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionSendResult {
    pub message_id: MessageId,
    pub state: LocalTransactionState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub committed: usize,
    pub rolled_back: usize,
    pub unresolved: usize,
    pub discarded: usize,
}

/// Producer for one producer group and its listener.
#[derive(Clone)]
pub struct TransactionalPublisher {
    broker: Arc<dyn MessageBroker>,
    group: String,
    listener: Arc<dyn TransactionListener>,
    options: CheckBackOptions,
}

impl TransactionalPublisher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        group: impl Into<String>,
        listener: Arc<dyn TransactionListener>,
        options: CheckBackOptions,
    ) -> Self {
        Self {
            broker,
            group: group.into(),
            listener,
            options,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Prepares the message, runs the local transaction and reports its
    /// outcome. A failed prepare returns the error without running the
    /// local transaction. A failed end-transaction is logged only: the
    /// half message is then resolved by check-back.
    #[tracing::instrument(skip(self, message), fields(group = %self.group, tag = %message.tag))]
    pub async fn publish(&self, message: Message) -> Result<TransactionSendResult> {
        let message_id = self.broker.prepare(&self.group, message.clone()).await?;

        let state = self.listener.execute_local(&message).await;
        metrics::counter!("transactional_messages_total", "state" => state.as_str()).increment(1);

        if state == LocalTransactionState::Unknown {
            tracing::info!(%message_id, "local transaction outcome unknown, awaiting check-back");
        } else if let Err(e) = self.broker.end_transaction(message_id, state).await {
            tracing::warn!(%message_id, %state, error = %e, "end transaction failed, awaiting check-back");
        } else {
            tracing::debug!(%message_id, %state, "transaction ended");
        }

        Ok(TransactionSendResult { message_id, state })
    }

    /// Resolves every half message of this group that has gone silent.
    #[tracing::instrument(skip(self), fields(group = %self.group))]
    pub async fn check_pending(&self) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        let pending = self.broker.unresolved(&self.group, self.options.check_after).await?;

        for half in pending {
            let id = half.message.id;
            let mut state = self.listener.check_local(&half.message).await;

            if state == LocalTransactionState::Unknown && half.checks + 1 >= self.options.max_checks {
                tracing::warn!(message_id = %id, checks = half.checks + 1, "check-back exhausted, discarding half message");
                state = LocalTransactionState::Rollback;
                report.discarded += 1;
            }

            match state {
                LocalTransactionState::Commit => report.committed += 1,
                LocalTransactionState::Rollback => report.rolled_back += 1,
                LocalTransactionState::Unknown => report.unresolved += 1,
            }
            metrics::counter!("transactional_checks_total", "state" => state.as_str()).increment(1);

            if let Err(e) = self.broker.end_transaction(id, state).await {
                tracing::warn!(message_id = %id, error = %e, "check-back resolution failed");
            }
        }

        Ok(report)
    }

    /// Runs check-back on an interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(group = %self.group, "check-back loop started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.check_pending().await {
                        tracing::error!(group = %self.group, error = %e, "check-back round failed");
                    }
                }
            }
        }

        tracing::info!(group = %self.group, "check-back loop stopped");
    }
}
