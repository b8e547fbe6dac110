//! The cross-service payment saga.
//!
//! There is no orchestrator: the order and wallet services each commit
//! locally and announce the result, either through an outbox row or a
//! transactional half message, and the other side reacts idempotently.
//! This crate wires both services onto one broker:
//!
//! 1. `PAYMENT_PENDING` (order, half message) debits the boss in the wallet.
//! 2. `PAYMENT_SUCCEEDED` / `PAYMENT_FAILED` (wallet, outbox) settle the order.
//! 3. `ORDER_CANCELLED` (order, half message) refunds a paid order.
//! 4. `ORDER_REFUND_SUCCEEDED` (wallet, half message) closes the cancellation.
//! 5. `ORDER_COMPLETED` (order, half message) pays the companion.

pub mod client;
pub mod error;
pub mod platform;

pub use client::LocalUserClient;
pub use error::{PlatformError, Result};
pub use platform::{Platform, PlatformOptions, SettleReport, Workers};
