//! Wire contracts for the broker topics.
//!
//! Every message carries its event type as the broker tag and a flat
//! snake_case JSON object as the body. The tag selects the payload type,
//! so decoding is a match on [`EventTag`] rather than a serde-tagged enum.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OrderId, UserId};

pub mod topics {
    /// Payment, cancellation, completion and refund events of both services.
    pub const ORDER_EVENTS: &str = "order_events";
    /// Follow graph changes.
    pub const FOLLOW_EVENTS: &str = "follow_events";
}

/// Broker tag of every event the system produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventTag {
    PaymentPending,
    PaymentSucceeded,
    PaymentFailed,
    OrderCancelled,
    OrderCompleted,
    OrderRefundSucceeded,
    UserFollow,
    UserUnfollow,
}

impl EventTag {
    pub const ALL: [EventTag; 8] = [
        EventTag::PaymentPending,
        EventTag::PaymentSucceeded,
        EventTag::PaymentFailed,
        EventTag::OrderCancelled,
        EventTag::OrderCompleted,
        EventTag::OrderRefundSucceeded,
        EventTag::UserFollow,
        EventTag::UserUnfollow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::PaymentPending => "PAYMENT_PENDING",
            EventTag::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            EventTag::PaymentFailed => "PAYMENT_FAILED",
            EventTag::OrderCancelled => "ORDER_CANCELLED",
            EventTag::OrderCompleted => "ORDER_COMPLETED",
            EventTag::OrderRefundSucceeded => "ORDER_REFUND_SUCCEEDED",
            EventTag::UserFollow => "USER_FOLLOW",
            EventTag::UserUnfollow => "USER_UNFOLLOW",
        }
    }

    /// Topic the tag is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            EventTag::UserFollow | EventTag::UserUnfollow => topics::FOLLOW_EVENTS,
            _ => topics::ORDER_EVENTS,
        }
    }

    /// Looks up a tag by its wire name. Unknown names yield `None` so that
    /// consumers can drop them.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a message cannot be turned into an event. Both are permanent:
/// redelivering the same bytes gives the same answer.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event tag: {0}")]
    UnknownTag(String),

    #[error("malformed {tag} payload: {source}")]
    Malformed {
        tag: EventTag,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {tag} payload: {reason}")]
    Invalid { tag: EventTag, reason: &'static str },
}

fn decode_body<T: DeserializeOwned>(tag: EventTag, body: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(body).map_err(|source| DecodeError::Malformed { tag, source })
}

fn require(tag: EventTag, ok: bool, reason: &'static str) -> Result<(), DecodeError> {
    if ok {
        Ok(())
    } else {
        Err(DecodeError::Invalid { tag, reason })
    }
}

/// Order asks the wallet to debit the boss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPending {
    pub order_id: OrderId,
    pub order_no: String,
    pub boss_id: UserId,
    pub companion_id: UserId,
    pub amount: i64,
    pub biz_order_id: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub game_mode: String,
    #[serde(default)]
    pub duration_minutes: i64,
    #[serde(default)]
    pub price_per_hour: i64,
}

/// Wallet reports a successful debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    pub order_id: OrderId,
    pub order_no: String,
    pub boss_id: UserId,
    pub amount: i64,
    pub biz_order_id: String,
}

/// Wallet reports a debit it refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub order_id: OrderId,
    pub order_no: String,
    pub boss_id: UserId,
    pub amount: i64,
    pub biz_order_id: String,
    pub reason: String,
}

/// Order was cancelled; `need_refund` tells the wallet whether money moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub order_no: String,
    pub boss_id: UserId,
    pub companion_id: UserId,
    pub amount: i64,
    pub biz_order_id: String,
    pub need_refund: bool,
    #[serde(default)]
    pub cancel_reason: String,
}

/// Order finished; the companion gets paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompleted {
    pub order_id: OrderId,
    pub order_no: String,
    pub boss_id: UserId,
    pub companion_id: UserId,
    pub amount: i64,
    pub biz_order_id: String,
}

/// Wallet credited the boss back for a cancelled order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundSucceeded {
    pub order_id: OrderId,
    pub order_no: String,
    pub biz_order_id: String,
    pub user_id: UserId,
    pub amount: i64,
}

/// Body of both follow-graph events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowPayload {
    pub follower_id: UserId,
    pub following_id: UserId,
}

/// Everything carried on the `order_events` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    PaymentPending(PaymentPending),
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(PaymentFailed),
    OrderCancelled(OrderCancelled),
    OrderCompleted(OrderCompleted),
    RefundSucceeded(RefundSucceeded),
}

impl OrderEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            OrderEvent::PaymentPending(_) => EventTag::PaymentPending,
            OrderEvent::PaymentSucceeded(_) => EventTag::PaymentSucceeded,
            OrderEvent::PaymentFailed(_) => EventTag::PaymentFailed,
            OrderEvent::OrderCancelled(_) => EventTag::OrderCancelled,
            OrderEvent::OrderCompleted(_) => EventTag::OrderCompleted,
            OrderEvent::RefundSucceeded(_) => EventTag::OrderRefundSucceeded,
        }
    }

    /// Serializes the payload without the tag.
    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        match self {
            OrderEvent::PaymentPending(p) => serde_json::to_string(p),
            OrderEvent::PaymentSucceeded(p) => serde_json::to_string(p),
            OrderEvent::PaymentFailed(p) => serde_json::to_string(p),
            OrderEvent::OrderCancelled(p) => serde_json::to_string(p),
            OrderEvent::OrderCompleted(p) => serde_json::to_string(p),
            OrderEvent::RefundSucceeded(p) => serde_json::to_string(p),
        }
    }

    /// Decodes and structurally validates a message body.
    pub fn decode(tag: &str, body: &[u8]) -> Result<Self, DecodeError> {
        let parsed = EventTag::parse(tag).ok_or_else(|| DecodeError::UnknownTag(tag.to_string()))?;
        let event = match parsed {
            EventTag::PaymentPending => OrderEvent::PaymentPending(decode_body(parsed, body)?),
            EventTag::PaymentSucceeded => OrderEvent::PaymentSucceeded(decode_body(parsed, body)?),
            EventTag::PaymentFailed => OrderEvent::PaymentFailed(decode_body(parsed, body)?),
            EventTag::OrderCancelled => OrderEvent::OrderCancelled(decode_body(parsed, body)?),
            EventTag::OrderCompleted => OrderEvent::OrderCompleted(decode_body(parsed, body)?),
            EventTag::OrderRefundSucceeded => {
                OrderEvent::RefundSucceeded(decode_body(parsed, body)?)
            }
            EventTag::UserFollow | EventTag::UserUnfollow => {
                return Err(DecodeError::UnknownTag(tag.to_string()));
            }
        };
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let tag = self.tag();
        match self {
            OrderEvent::PaymentPending(p) => {
                require(tag, !p.boss_id.is_zero(), "boss_id is required")?;
                require(tag, p.amount > 0, "amount must be positive")?;
                require(tag, !p.biz_order_id.is_empty(), "biz_order_id is required")
            }
            OrderEvent::PaymentSucceeded(p) => {
                require(tag, !p.order_no.is_empty() || !p.order_id.is_zero(), "order reference is required")
            }
            OrderEvent::PaymentFailed(p) => {
                require(tag, !p.order_no.is_empty() || !p.order_id.is_zero(), "order reference is required")
            }
            OrderEvent::OrderCancelled(p) => {
                require(tag, !p.boss_id.is_zero(), "boss_id is required")?;
                require(tag, p.amount > 0, "amount must be positive")
            }
            OrderEvent::OrderCompleted(p) => {
                require(tag, !p.companion_id.is_zero(), "companion_id is required")?;
                require(tag, p.amount > 0, "amount must be positive")?;
                require(tag, !p.biz_order_id.is_empty(), "biz_order_id is required")
            }
            OrderEvent::RefundSucceeded(p) => {
                require(tag, !p.order_no.is_empty() || !p.order_id.is_zero(), "order reference is required")
            }
        }
    }
}

/// Everything carried on the `follow_events` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowEvent {
    Follow(FollowPayload),
    Unfollow(FollowPayload),
}

impl FollowEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            FollowEvent::Follow(_) => EventTag::UserFollow,
            FollowEvent::Unfollow(_) => EventTag::UserUnfollow,
        }
    }

    pub fn payload(&self) -> FollowPayload {
        match self {
            FollowEvent::Follow(p) | FollowEvent::Unfollow(p) => *p,
        }
    }

    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.payload())
    }

    pub fn decode(tag: &str, body: &[u8]) -> Result<Self, DecodeError> {
        let parsed = EventTag::parse(tag).ok_or_else(|| DecodeError::UnknownTag(tag.to_string()))?;
        let event = match parsed {
            EventTag::UserFollow => FollowEvent::Follow(decode_body(parsed, body)?),
            EventTag::UserUnfollow => FollowEvent::Unfollow(decode_body(parsed, body)?),
            _ => return Err(DecodeError::UnknownTag(tag.to_string())),
        };
        let p = event.payload();
        require(parsed, !p.follower_id.is_zero(), "follower_id is required")?;
        require(parsed, !p.following_id.is_zero(), "following_id is required")?;
        require(parsed, p.follower_id != p.following_id, "cannot follow yourself")?;
        Ok(event)
    }
}
