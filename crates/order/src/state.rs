//! Order state machine.

use serde::{Deserialize, Serialize};

/// The status of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// Created ──► Paid ──► Accepted ──► InService ──► Completed ──► Rated
///    │          │          │    └──────────────────►─┘
///    │          └──────────┴──► CancelRefunding ──► Cancelled
///    └────────────────────────────────────────────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Placed, payment not yet confirmed.
    #[default]
    Created,

    /// The boss has been debited.
    Paid,

    /// The companion took the order.
    Accepted,

    /// The session is running.
    InService,

    /// Finished; the companion gets paid.
    Completed,

    /// The boss left a rating (terminal state).
    Rated,

    /// Cancelled after payment, waiting for the refund to land.
    CancelRefunding,

    /// Cancelled (terminal state).
    Cancelled,
}

impl OrderStatus {
    /// Returns true if a confirmed payment can move the order to `Paid`.
    pub fn can_pay(&self) -> bool {
        matches!(self, OrderStatus::Created)
    }

    /// Returns true if the companion can accept the order.
    pub fn can_accept(&self) -> bool {
        matches!(self, OrderStatus::Paid)
    }

    /// Returns true if the session can start.
    pub fn can_start(&self) -> bool {
        matches!(self, OrderStatus::Accepted)
    }

    /// Returns true if the order can be completed.
    pub fn can_complete(&self) -> bool {
        matches!(self, OrderStatus::Accepted | OrderStatus::InService)
    }

    /// Returns true if the boss can rate the order.
    pub fn can_rate(&self) -> bool {
        matches!(self, OrderStatus::Completed)
    }

    /// Returns true if the order can be cancelled.
    pub fn can_cancel(&self) -> bool {
        matches!(self, OrderStatus::Created | OrderStatus::Paid | OrderStatus::Accepted)
    }

    /// Returns true if cancelling from this status owes the boss a refund.
    pub fn owes_refund(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Accepted)
    }

    /// Returns true if a confirmed refund can finish the cancellation.
    pub fn can_finish_refund(&self) -> bool {
        matches!(self, OrderStatus::CancelRefunding)
    }

    /// Returns true if the order went through cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OrderStatus::CancelRefunding | OrderStatus::Cancelled)
    }

    /// Returns true if this is a terminal status (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Rated | OrderStatus::Cancelled)
    }

    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Paid => "PAID",
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::InService => "IN_SERVICE",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Rated => "RATED",
            OrderStatus::CancelRefunding => "CANCEL_REFUNDING",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CREATED" => OrderStatus::Created,
            "PAID" => OrderStatus::Paid,
            "ACCEPTED" => OrderStatus::Accepted,
            "IN_SERVICE" => OrderStatus::InService,
            "COMPLETED" => OrderStatus::Completed,
            "RATED" => OrderStatus::Rated,
            "CANCEL_REFUNDING" => OrderStatus::CancelRefunding,
            "CANCELLED" => OrderStatus::Cancelled,
            _ => return None,
        })
    }

    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::Created,
        OrderStatus::Paid,
        OrderStatus::Accepted,
        OrderStatus::InService,
        OrderStatus::Completed,
        OrderStatus::Rated,
        OrderStatus::CancelRefunding,
        OrderStatus::Cancelled,
    ];
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_created() {
        assert_eq!(OrderStatus::default(), OrderStatus::Created);
    }

    #[test]
    fn test_only_created_can_pay() {
        for status in OrderStatus::ALL {
            assert_eq!(status.can_pay(), status == OrderStatus::Created);
        }
    }

    #[test]
    fn test_complete_from_accepted_or_in_service() {
        assert!(!OrderStatus::Paid.can_complete());
        assert!(OrderStatus::Accepted.can_complete());
        assert!(OrderStatus::InService.can_complete());
        assert!(!OrderStatus::Completed.can_complete());
        assert!(!OrderStatus::Rated.can_complete());
    }

    #[test]
    fn test_refund_owed_only_after_payment() {
        assert!(!OrderStatus::Created.owes_refund());
        assert!(OrderStatus::Paid.owes_refund());
        assert!(OrderStatus::Accepted.owes_refund());
        assert!(!OrderStatus::InService.can_cancel());
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = OrderStatus::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![OrderStatus::Rated, OrderStatus::Cancelled]);
        for status in terminal {
            assert!(!status.can_pay());
            assert!(!status.can_accept());
            assert!(!status.can_start());
            assert!(!status.can_complete());
            assert!(!status.can_rate());
            assert!(!status.can_cancel());
            assert!(!status.can_finish_refund());
        }
    }

    #[test]
    fn test_wire_names() {
        for status in OrderStatus::ALL {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(OrderStatus::parse("SHIPPED"), None);
    }
}
