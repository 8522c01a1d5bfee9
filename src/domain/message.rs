use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::order::OrderType;
use crate::error::{EngineError, Result};

/// Worker queues, by stable wire name.
///
/// The first three are consumed by lifecycle workers; the rest are produced
/// as fan-out from reconciliation and exit handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Queue {
    StopLoss,
    TakeProfit,
    ExitPosition,
    ReduceOrders,
    StopOrders,
    /// Sorted set scored by ready-time, member = position id
    Accounting,
    ProfileNotifications,
    /// Copy-trade propagation
    Signals,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::StopLoss => "stopLoss",
            Queue::TakeProfit => "takeProfit",
            Queue::ExitPosition => "exitPosition",
            Queue::ReduceOrders => "reduceOrdersQueue",
            Queue::StopOrders => "stopOrdersQueue",
            Queue::Accounting => "accountingQueue",
            Queue::ProfileNotifications => "profileNotifications",
            Queue::Signals => "signals",
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Queue {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "stopLoss" => Ok(Queue::StopLoss),
            "takeProfit" => Ok(Queue::TakeProfit),
            "exitPosition" => Ok(Queue::ExitPosition),
            "reduceOrdersQueue" => Ok(Queue::ReduceOrders),
            "stopOrdersQueue" => Ok(Queue::StopOrders),
            "accountingQueue" => Ok(Queue::Accounting),
            "profileNotifications" => Ok(Queue::ProfileNotifications),
            "signals" => Ok(Queue::Signals),
            other => Err(EngineError::InvalidMessage(format!(
                "unknown queue: {other}"
            ))),
        }
    }
}

/// Work item consumed by lifecycle workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(rename = "positionId")]
    pub position_id: String,
    /// Numeric lifecycle code, see `PositionStatus`
    pub status: u16,
    #[serde(rename = "limitPrice", skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(rename = "orderType", skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    /// Exit submission attempts consumed so far (bounded retry)
    #[serde(default)]
    pub attempt: u32,
    /// Times this message has been requeued after a transient failure
    #[serde(default)]
    pub redeliveries: u32,
}

impl QueueMessage {
    pub fn new(position_id: impl Into<String>, status: u16) -> Self {
        Self {
            position_id: position_id.into(),
            status,
            limit_price: None,
            order_type: None,
            attempt: 0,
            redeliveries: 0,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn redelivered(&self) -> Self {
        Self {
            redeliveries: self.redeliveries + 1,
            ..self.clone()
        }
    }
}

/// Command pushed to the profile-notifications queue; delivery itself is a
/// collaborator concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationCommand {
    pub command: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "positionId")]
    pub position_id: String,
    pub params: serde_json::Value,
}
