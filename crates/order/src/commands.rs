//! Order commands.

use common::{OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{OrderError, Result};

const MAX_GAME_FIELD_LEN: usize = 64;

/// How a new order is paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    /// The wallet debits asynchronously from a `PAYMENT_PENDING` message.
    #[default]
    Deferred,

    /// The order service calls the wallet before answering.
    Direct,
}

/// Command to place a new order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    /// The paying user.
    pub boss_id: UserId,

    /// The user providing the session.
    pub companion_id: UserId,

    #[serde(default)]
    pub game_name: String,

    #[serde(default)]
    pub game_mode: String,

    pub duration_minutes: i32,

    #[serde(default)]
    pub settlement: Settlement,
}

impl CreateOrder {
    /// Creates a deferred-settlement order command.
    pub fn new(boss_id: UserId, companion_id: UserId, duration_minutes: i32) -> Self {
        Self {
            boss_id,
            companion_id,
            game_name: String::new(),
            game_mode: String::new(),
            duration_minutes,
            settlement: Settlement::Deferred,
        }
    }

    pub fn with_game(mut self, name: impl Into<String>, mode: impl Into<String>) -> Self {
        self.game_name = name.into();
        self.game_mode = mode.into();
        self
    }

    pub fn with_settlement(mut self, settlement: Settlement) -> Self {
        self.settlement = settlement;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.boss_id.is_zero() {
            return Err(OrderError::InvalidArgument("boss_id is required"));
        }
        if self.companion_id.is_zero() {
            return Err(OrderError::InvalidArgument("companion_id is required"));
        }
        if self.boss_id == self.companion_id {
            return Err(OrderError::InvalidArgument("cannot order yourself"));
        }
        if self.duration_minutes <= 0 {
            return Err(OrderError::InvalidArgument("duration_minutes must be positive"));
        }
        if self.game_name.chars().count() > MAX_GAME_FIELD_LEN || self.game_mode.chars().count() > MAX_GAME_FIELD_LEN {
            return Err(OrderError::InvalidArgument("game name and mode are limited to 64 characters"));
        }
        Ok(())
    }
}

/// Command to accept, start or complete an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAction {
    pub order_id: OrderId,

    /// The user issuing the command.
    pub operator_id: UserId,
}

impl OrderAction {
    pub fn new(order_id: OrderId, operator_id: UserId) -> Self {
        Self { order_id, operator_id }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.order_id.is_zero() {
            return Err(OrderError::InvalidArgument("order_id is required"));
        }
        if self.operator_id.is_zero() {
            return Err(OrderError::InvalidArgument("operator_id is required"));
        }
        Ok(())
    }
}

/// Command to cancel an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub operator_id: UserId,
    #[serde(default)]
    pub reason: String,
}

impl CancelOrder {
    pub fn new(order_id: OrderId, operator_id: UserId, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            operator_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn action(&self) -> OrderAction {
        OrderAction::new(self.order_id, self.operator_id)
    }
}

/// Command to rate a completed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateOrder {
    pub order_id: OrderId,
    pub operator_id: UserId,

    /// 0 to 5.
    pub rating: i16,

    #[serde(default)]
    pub comment: String,
}

impl RateOrder {
    pub fn new(order_id: OrderId, operator_id: UserId, rating: i16, comment: impl Into<String>) -> Self {
        Self {
            order_id,
            operator_id,
            rating,
            comment: comment.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        OrderAction::new(self.order_id, self.operator_id).validate()?;
        if !(0..=5).contains(&self.rating) {
            return Err(OrderError::InvalidArgument("rating must be between 0 and 5"));
        }
        Ok(())
    }
}
