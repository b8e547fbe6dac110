//! Types shared by the order and wallet services.
//!
//! Nothing in here touches storage or the broker: identifiers, the
//! caller-facing error codes, and the JSON contracts carried on the
//! `order_events` and `follow_events` topics.

pub mod code;
pub mod events;
pub mod types;

pub use code::ErrorCode;
pub use events::{
    DecodeError, EventTag, FollowEvent, FollowPayload, OrderCancelled, OrderCompleted, OrderEvent,
    PaymentFailed, PaymentPending, PaymentSucceeded, RefundSucceeded, topics,
};
pub use types::{OrderId, UserId};
