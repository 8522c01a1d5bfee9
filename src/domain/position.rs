use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::order::{Order, OrderSide};
use crate::error::{EngineError, Result};

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens the position
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes the position
    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }
}

/// Entry strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryMode {
    /// One entry leg
    Single,
    /// Two opposite-side legs racing to establish direction; the losing leg
    /// is abandoned without closing the position
    Multi,
}

/// Numeric lifecycle code carried on queue messages and persisted documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum PositionStatus {
    Created = 100,
    /// Entry order submitted, awaiting fill
    EntryPending = 110,
    /// Entry filled
    Bought = 200,
    ReEntryPending = 210,
    TakeProfitPending = 300,
    StopLossPending = 310,
    /// Exit requested, close orders in flight
    Exiting = 400,
    Closed = 500,
    ClosedError = 900,
    ClosedInsufficientFunds = 961,
    ClosedBelowMinimum = 962,
    ClosedAuthRevoked = 963,
    ClosedExitError = 964,
}

impl PositionStatus {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Result<Self> {
        let status = match code {
            100 => Self::Created,
            110 => Self::EntryPending,
            200 => Self::Bought,
            210 => Self::ReEntryPending,
            300 => Self::TakeProfitPending,
            310 => Self::StopLossPending,
            400 => Self::Exiting,
            500 => Self::Closed,
            900 => Self::ClosedError,
            961 => Self::ClosedInsufficientFunds,
            962 => Self::ClosedBelowMinimum,
            963 => Self::ClosedAuthRevoked,
            964 => Self::ClosedExitError,
            other => return Err(EngineError::InvalidStatusCode(other)),
        };
        Ok(status)
    }

    pub fn is_terminal(&self) -> bool {
        self.code() >= 500
    }
}

/// Target kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    TakeProfit,
    ReEntry,
}

/// Planned partial exit (take-profit) or staged re-entry (DCA)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub target_id: String,
    pub kind: TargetKind,
    /// Absolute trigger price; exactly one of `price` / `pct_of_entry` is set
    pub price: Option<Decimal>,
    /// Trigger as a percentage move from the entry price
    pub pct_of_entry: Option<Decimal>,
    /// Share of the position amount this target acts on
    pub amount_pct: Decimal,
    pub done: bool,
    pub skipped: bool,
    pub cancelled: bool,
    /// Order currently realizing this target, if armed
    pub order_id: Option<String>,
}

impl Target {
    pub fn is_resolved(&self) -> bool {
        self.done || self.skipped || self.cancelled
    }

    /// Effective trigger price given the realized entry average
    pub fn trigger_price(&self, avg_entry: Option<Decimal>) -> Option<Decimal> {
        if let Some(price) = self.price {
            return Some(price);
        }
        match (self.pct_of_entry, avg_entry) {
            (Some(pct), Some(entry)) => Some(entry * (Decimal::ONE + pct)),
            _ => None,
        }
    }
}

/// Where a position trades, used to key the trigger indices
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketRef {
    pub exchange: String,
    /// spot / margin / futures
    pub market_type: String,
    pub symbol: String,
}

impl std::fmt::Display for MarketRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.market_type, self.symbol)
    }
}

/// Aggregate root: one tracked trade with its orders and targets.
///
/// At most one process holds the write lock for a position at any instant;
/// `closed = true` is terminal and never reverts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub user_id: String,
    /// Exchange API connection this position trades through
    pub connection_id: String,
    pub market: MarketRef,
    pub side: Side,
    pub entry_mode: EntryMode,
    pub status: PositionStatus,
    pub orders: BTreeMap<String, Order>,
    pub take_profit_targets: Vec<Target>,
    pub reentry_targets: Vec<Target>,
    pub closed: bool,
    /// A market close order was successfully submitted during exit
    pub sell_performed: bool,
    /// An exit is being orchestrated; blocks concurrent exit requests
    pub exit_in_flight: bool,
    /// Realized average entry price
    pub avg_price: Option<Decimal>,
    /// Stop-loss trigger price; ratchets with favorable movement when a
    /// trailing stop is configured
    pub stop_price: Option<Decimal>,
    /// Base amount acquired so far
    pub amount: Decimal,
    /// Base amount disposed so far
    pub sold_amount: Decimal,
    /// Legacy document-level lock flag, kept alongside the store-backed
    /// hard lock
    pub locked_by: Option<String>,
    pub last_update: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Position {
    /// Orders not yet terminal
    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| !o.is_terminal())
    }

    pub fn all_orders_done(&self) -> bool {
        self.orders.values().all(|o| o.done)
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// Entry legs still live (relevant in MULTI mode)
    pub fn live_entry_legs(&self) -> usize {
        self.orders
            .values()
            .filter(|o| {
                matches!(o.kind, super::order::OrderKind::Entry) && !o.is_terminal()
            })
            .count()
    }
}

/// Typed partial update applied at the PositionStore boundary.
///
/// `None` fields are left untouched; `upsert_orders` merges by order id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub status: Option<PositionStatus>,
    pub closed: Option<bool>,
    pub sell_performed: Option<bool>,
    pub exit_in_flight: Option<bool>,
    pub avg_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub sold_amount: Option<Decimal>,
    pub locked_by: Option<Option<String>>,
    #[serde(default)]
    pub upsert_orders: Vec<Order>,
    pub take_profit_targets: Option<Vec<Target>>,
    pub reentry_targets: Option<Vec<Target>>,
}

impl PositionUpdate {
    pub fn status(status: PositionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn close_with(status: PositionStatus) -> Self {
        Self {
            status: Some(status),
            closed: Some(true),
            exit_in_flight: Some(false),
            ..Default::default()
        }
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.upsert_orders.push(order);
        self
    }

    /// Apply onto a position. `closed` never reverts once set.
    pub fn apply(self, position: &mut Position, touch_last_update: bool) {
        if let Some(status) = self.status {
            position.status = status;
        }
        if let Some(closed) = self.closed {
            position.closed = position.closed || closed;
        }
        if let Some(sell_performed) = self.sell_performed {
            position.sell_performed = sell_performed;
        }
        if let Some(exit_in_flight) = self.exit_in_flight {
            position.exit_in_flight = exit_in_flight;
        }
        if let Some(avg_price) = self.avg_price {
            position.avg_price = Some(avg_price);
        }
        if let Some(stop_price) = self.stop_price {
            position.stop_price = Some(stop_price);
        }
        if let Some(amount) = self.amount {
            position.amount = amount;
        }
        if let Some(sold_amount) = self.sold_amount {
            position.sold_amount = sold_amount;
        }
        if let Some(locked_by) = self.locked_by {
            position.locked_by = locked_by;
        }
        for order in self.upsert_orders {
            position.orders.insert(order.order_id.clone(), order);
        }
        if let Some(targets) = self.take_profit_targets {
            position.take_profit_targets = targets;
        }
        if let Some(targets) = self.reentry_targets {
            position.reentry_targets = targets;
        }
        if touch_last_update {
            position.last_update = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderKind, OrderType};
    use crate::testutil::test_position;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_code_round_trip() {
        for status in [
            PositionStatus::Created,
            PositionStatus::EntryPending,
            PositionStatus::Bought,
            PositionStatus::ReEntryPending,
            PositionStatus::TakeProfitPending,
            PositionStatus::StopLossPending,
            PositionStatus::Exiting,
            PositionStatus::Closed,
            PositionStatus::ClosedError,
            PositionStatus::ClosedInsufficientFunds,
            PositionStatus::ClosedBelowMinimum,
            PositionStatus::ClosedAuthRevoked,
            PositionStatus::ClosedExitError,
        ] {
            assert_eq!(PositionStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(PositionStatus::from_code(42).is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!PositionStatus::Bought.is_terminal());
        assert!(!PositionStatus::Exiting.is_terminal());
        assert!(PositionStatus::Closed.is_terminal());
        assert!(PositionStatus::ClosedInsufficientFunds.is_terminal());
    }

    #[test]
    fn test_closed_never_reverts() {
        let mut position = test_position("p1");
        PositionUpdate {
            closed: Some(true),
            ..Default::default()
        }
        .apply(&mut position, false);
        assert!(position.closed);

        PositionUpdate {
            closed: Some(false),
            ..Default::default()
        }
        .apply(&mut position, false);
        assert!(position.closed, "closed is terminal and must not revert");
    }

    #[test]
    fn test_update_upserts_orders() {
        let mut position = test_position("p1");
        let order = Order::new(
            "ord-1",
            OrderKind::Entry,
            OrderType::Market,
            OrderSide::Buy,
            None,
            dec!(10),
        );
        PositionUpdate::default()
            .with_order(order.clone())
            .apply(&mut position, true);
        assert!(position.orders.contains_key("ord-1"));

        let mut updated = order;
        updated.cost = dec!(500);
        PositionUpdate::default()
            .with_order(updated)
            .apply(&mut position, true);
        assert_eq!(position.orders["ord-1"].cost, dec!(500));
        assert_eq!(position.orders.len(), 1);
    }

    #[test]
    fn test_target_trigger_price() {
        let target = Target {
            target_id: "t1".to_string(),
            kind: TargetKind::TakeProfit,
            price: None,
            pct_of_entry: Some(dec!(0.05)),
            amount_pct: dec!(0.5),
            done: false,
            skipped: false,
            cancelled: false,
            order_id: None,
        };
        assert_eq!(target.trigger_price(Some(dec!(100))), Some(dec!(105.00)));
        assert_eq!(target.trigger_price(None), None);
    }

    #[test]
    fn test_side_order_mapping() {
        assert_eq!(Side::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(Side::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_order_side(), OrderSide::Buy);
    }
}
