//! Outbox pattern shared by the order and wallet services.
//!
//! A service writes a [`NewOutboxEvent`] inside the same local
//! transaction as the business change it announces. The
//! [`OutboxDispatcher`] later publishes pending rows to the broker and
//! records the result on the row.
//!
//! Consumers whose effects are not idempotent by business key record a
//! [`ProcessedMessage`] in the same transaction as the effect.

pub mod dispatcher;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod processed;
pub mod store;

pub use dispatcher::{DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use error::{Result, StoreError};
pub use event::{NewOutboxEvent, OutboxEvent, OutboxStatus};
pub use memory::{InMemoryOutboxStore, OutboxTable, ProcessedTable};
pub use postgres::PostgresOutboxStore;
pub use processed::ProcessedMessage;
pub use store::OutboxStore;
