//! Broker abstraction used by both services.
//!
//! Producers either [`MessageBroker::send`] directly (the outbox dispatcher)
//! or go through a [`TransactionalPublisher`], which couples a local
//! database transaction to a half message. Consumers wrap a
//! [`Subscription`] and a [`MessageHandler`] in a [`Consumer`] that owns
//! redelivery and dead-lettering.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod transaction;

pub use broker::{HalfMessage, MessageBroker, SendReceipt, Subscription, TagFilter};
pub use consumer::{ConsumeOutcome, Consumer, MessageHandler, RetryPolicy};
pub use error::{BrokerError, Result};
pub use memory::InMemoryBroker;
pub use message::{Delivery, Message, MessageBuilder, MessageId};
pub use transaction::{
    CheckBackOptions, CheckReport, LocalTransactionState, TransactionListener,
    TransactionSendResult, TransactionalPublisher,
};
