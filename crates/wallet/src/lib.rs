//! User and wallet service.
//!
//! The ledger is the only resource with cross-request contention: every
//! balance change locks the user's wallet row, checks the
//! `(type, biz_order_id)` idempotency key and appends an immutable
//! [`WalletTransaction`] in one local transaction.

pub mod companion;
pub mod consumers;
pub mod error;
pub mod listener;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod service;
pub mod store;

pub use companion::CompanionService;
pub use consumers::{FollowConsumer, OrderEventsConsumer};
pub use error::{Result, WalletError};
pub use listener::RefundTransactionListener;
pub use memory::InMemoryUserStore;
pub use model::{
    CompanionProfile, CompanionStatus, NewWalletTransaction, TransactionKind, UserStats, Wallet,
    WalletTransaction,
};
pub use postgres::PostgresUserStore;
pub use service::{AppliedChange, BalanceChange, BalanceUpdate, EmitOutboxEvent, LedgerHook, WalletService};
pub use store::{UserStore, UserTx};

/// Producer group of the wallet service's transactional messages.
pub const PRODUCER_GROUP: &str = "user-service-tx";

/// Consumer group of the wallet service.
pub const CONSUMER_GROUP: &str = "user-service";
