use chrono::{DateTime, Utc};
use common::{OrderCancelled, OrderCompleted, OrderId, PaymentPending, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrderError, Result};
use crate::state::OrderStatus;

/// External order number: the UTC date followed by six random digits.
pub fn generate_order_no(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().as_u128() % 1_000_000;
    format!("{}{:06}", now.format("%Y%m%d"), suffix)
}

/// What a confirmed debit did to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentConfirmation {
    /// CREATED moved to PAID.
    Paid,
    /// The order had been cancelled unpaid; the boss must be refunded.
    Refund,
    /// Already applied, or the order is past payment.
    Ignored,
}

/// A booked session between a boss and a companion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_no: String,
    pub boss_id: UserId,
    pub companion_id: UserId,
    pub game_name: String,
    pub game_mode: String,
    pub duration_minutes: i32,
    pub price_per_hour: i64,
    pub total_amount: i64,
    pub status: OrderStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub rating: Option<i16>,
    pub comment: String,
    pub cancel_reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Idempotency key of every ledger entry that belongs to this order.
    pub fn biz_order_id(&self) -> &str {
        &self.order_no
    }

    pub fn is_boss(&self, user_id: UserId) -> bool {
        self.boss_id == user_id
    }

    pub fn is_companion(&self, user_id: UserId) -> bool {
        self.companion_id == user_id
    }

    fn guard(&self, allowed: bool, action: &'static str) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(OrderError::transition(self.status, action))
        }
    }

    fn touch(&mut self, status: OrderStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn pay(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.guard(self.status.can_pay(), "pay")?;
        self.paid_at = Some(now);
        self.touch(OrderStatus::Paid, now);
        Ok(())
    }

    pub fn accept(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.guard(self.status.can_accept(), "accept")?;
        self.accepted_at = Some(now);
        self.touch(OrderStatus::Accepted, now);
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.guard(self.status.can_start(), "start")?;
        self.start_at = Some(now);
        self.touch(OrderStatus::InService, now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.guard(self.status.can_complete(), "complete")?;
        self.completed_at = Some(now);
        self.touch(OrderStatus::Completed, now);
        Ok(())
    }

    pub fn rate(&mut self, rating: i16, comment: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status == OrderStatus::Rated {
            return Err(OrderError::AlreadyRated);
        }
        self.guard(self.status.can_rate(), "rate")?;
        self.rating = Some(rating);
        self.comment = comment.into();
        self.touch(OrderStatus::Rated, now);
        Ok(())
    }

    /// Cancels the order and returns whether the boss is owed a refund.
    /// A paid order waits in `CancelRefunding` until the refund lands.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<bool> {
        self.guard(self.status.can_cancel(), "cancel")?;
        let need_refund = self.status.owes_refund();
        self.cancelled_at = Some(now);
        self.cancel_reason = reason.into();
        let next = if need_refund {
            OrderStatus::CancelRefunding
        } else {
            OrderStatus::Cancelled
        };
        self.touch(next, now);
        Ok(need_refund)
    }

    pub fn finish_refund(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.guard(self.status.can_finish_refund(), "finish refund of")?;
        self.touch(OrderStatus::Cancelled, now);
        Ok(())
    }

    /// Records a debit confirmed after the order was already cancelled
    /// without payment. Returns true when the boss must be refunded; a
    /// second confirmation returns false.
    fn record_late_payment(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != OrderStatus::Cancelled || self.paid_at.is_some() {
            return false;
        }
        self.paid_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Applies a confirmed debit of the order amount.
    pub fn confirm_payment(&mut self, now: DateTime<Utc>) -> PaymentConfirmation {
        if self.status.can_pay() {
            self.paid_at = Some(now);
            self.touch(OrderStatus::Paid, now);
            PaymentConfirmation::Paid
        } else if self.record_late_payment(now) {
            PaymentConfirmation::Refund
        } else {
            PaymentConfirmation::Ignored
        }
    }

    pub fn cancelled_event(&self, need_refund: bool) -> OrderCancelled {
        OrderCancelled {
            order_id: self.id,
            order_no: self.order_no.clone(),
            boss_id: self.boss_id,
            companion_id: self.companion_id,
            amount: self.total_amount,
            biz_order_id: self.order_no.clone(),
            need_refund,
            cancel_reason: self.cancel_reason.clone(),
        }
    }

    pub fn completed_event(&self) -> OrderCompleted {
        OrderCompleted {
            order_id: self.id,
            order_no: self.order_no.clone(),
            boss_id: self.boss_id,
            companion_id: self.companion_id,
            amount: self.total_amount,
            biz_order_id: self.order_no.clone(),
        }
    }
}

/// Insert payload for a freshly placed order. The id is allocated before
/// the insert so that it can travel in the `PAYMENT_PENDING` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub id: OrderId,
    pub order_no: String,
    pub boss_id: UserId,
    pub companion_id: UserId,
    pub game_name: String,
    pub game_mode: String,
    pub duration_minutes: i32,
    pub price_per_hour: i64,
    pub total_amount: i64,
}

impl NewOrder {
    /// Rebuilds the insert from the payment request that carries it.
    pub fn from_pending(p: &PaymentPending) -> Result<Self> {
        let duration_minutes =
            i32::try_from(p.duration_minutes).map_err(|_| OrderError::InvalidArgument("duration is out of range"))?;
        Ok(Self {
            id: p.order_id,
            order_no: p.order_no.clone(),
            boss_id: p.boss_id,
            companion_id: p.companion_id,
            game_name: p.game_name.clone(),
            game_mode: p.game_mode.clone(),
            duration_minutes,
            price_per_hour: p.price_per_hour,
            total_amount: p.amount,
        })
    }

    /// The row as it exists right after insertion.
    pub fn into_order(self, now: DateTime<Utc>) -> Order {
        Order {
            id: self.id,
            order_no: self.order_no,
            boss_id: self.boss_id,
            companion_id: self.companion_id,
            game_name: self.game_name,
            game_mode: self.game_mode,
            duration_minutes: self.duration_minutes,
            price_per_hour: self.price_per_hour,
            total_amount: self.total_amount,
            status: OrderStatus::Created,
            paid_at: None,
            accepted_at: None,
            start_at: None,
            completed_at: None,
            cancelled_at: None,
            rating: None,
            comment: String::new(),
            cancel_reason: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn payment_pending(&self) -> PaymentPending {
        PaymentPending {
            order_id: self.id,
            order_no: self.order_no.clone(),
            boss_id: self.boss_id,
            companion_id: self.companion_id,
            amount: self.total_amount,
            biz_order_id: self.order_no.clone(),
            game_name: self.game_name.clone(),
            game_mode: self.game_mode.clone(),
            duration_minutes: i64::from(self.duration_minutes),
            price_per_hour: self.price_per_hour,
        }
    }
}
