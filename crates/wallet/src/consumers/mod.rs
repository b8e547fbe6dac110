//! Message handlers of the user service.

mod follow;
mod order_events;

pub use follow::FollowConsumer;
pub use order_events::{OrderEventsConsumer, ReleaseCompanion};

/// Tags the user service consumes from the order events topic.
pub const ORDER_EVENT_TAGS: &str = "PAYMENT_PENDING || ORDER_CANCELLED || ORDER_COMPLETED";

/// Tags the user service consumes from the follow events topic.
pub const FOLLOW_EVENT_TAGS: &str = "USER_FOLLOW || USER_UNFOLLOW";
