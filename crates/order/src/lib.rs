//! Order service.
//!
//! Orders move through [`OrderStatus`] by two kinds of writes: RPC
//! commands validated against the caller's role, and idempotent updates
//! driven by consumed payment and refund events. Every write locks the
//! order row and re-checks the pre-state, so stale or repeated events
//! become no-ops.

pub mod client;
pub mod commands;
pub mod consumer;
pub mod error;
pub mod listener;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod service;
pub mod state;
pub mod store;

pub use client::{ClientError, CompanionInfo, UserClient};
pub use commands::{CancelOrder, CreateOrder, OrderAction, RateOrder, Settlement};
pub use consumer::{SETTLEMENT_TAGS, SettlementConsumer};
pub use error::{OrderError, Result};
pub use listener::OrderTransactionListener;
pub use memory::InMemoryOrderStore;
pub use model::{NewOrder, Order, PaymentConfirmation, generate_order_no};
pub use postgres::PostgresOrderStore;
pub use service::OrderService;
pub use state::OrderStatus;
pub use store::{OrderStore, OrderTx};

/// Producer group of the order service's transactional messages.
pub const PRODUCER_GROUP: &str = "order-service-tx";

/// Consumer group of the order service.
pub const CONSUMER_GROUP: &str = "order-service";
