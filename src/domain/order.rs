use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// What role an order plays in the position lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Entry,
    ReEntry,
    TakeProfit,
    StopLoss,
    Exit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderKind::Entry => "entry",
            OrderKind::ReEntry => "re_entry",
            OrderKind::TakeProfit => "take_profit",
            OrderKind::StopLoss => "stop_loss",
            OrderKind::Exit => "exit",
        };
        write!(f, "{s}")
    }
}

/// Exchange-reported order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    /// Resting on the book (or not yet acknowledged)
    Open,
    /// Fully executed
    Closed,
    Canceled,
    Expired,
}

/// Order tracked under a position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub kind: OrderKind,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub status: ExchangeOrderStatus,
    /// Terminal for our purposes: filled with nonzero cost, or explicitly
    /// resolved as cancelled/expired/errored. Never reverts.
    pub done: bool,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    /// Amount confirmed executed so far
    pub filled_amount: Decimal,
    /// Quote-currency cost of the executed part
    pub cost: Decimal,
    pub error: Option<String>,
    /// Target this order realizes, if any
    pub target_id: Option<String>,
    /// Transient exchange errors seen since the last successful check
    #[serde(default)]
    pub transient_retries: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        order_id: impl Into<String>,
        kind: OrderKind,
        order_type: OrderType,
        side: OrderSide,
        price: Option<Decimal>,
        amount: Decimal,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            kind,
            order_type,
            side,
            status: ExchangeOrderStatus::Open,
            done: false,
            price,
            amount,
            filled_amount: Decimal::ZERO,
            cost: Decimal::ZERO,
            error: None,
            target_id: None,
            transient_retries: 0,
            last_checked_at: None,
            created_at: Utc::now(),
        }
    }

    /// Terminal with a realized fill, or resolved without one.
    pub fn is_terminal(&self) -> bool {
        if self.done {
            return true;
        }
        match self.status {
            ExchangeOrderStatus::Closed => self.cost > Decimal::ZERO,
            ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Expired => true,
            ExchangeOrderStatus::Open => false,
        }
    }

    /// Seconds since the last authoritative check, if any.
    pub fn check_age_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_checked_at
            .map(|checked| (now - checked).num_seconds())
    }
}

/// A single trade fill reported by the exchange for an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub trade_id: String,
    pub order_id: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub cost: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market_entry(amount: Decimal) -> Order {
        Order::new(
            "ord-1",
            OrderKind::Entry,
            OrderType::Market,
            OrderSide::Buy,
            None,
            amount,
        )
    }

    #[test]
    fn test_open_order_is_not_terminal() {
        let order = market_entry(dec!(10));
        assert!(!order.is_terminal());
    }

    #[test]
    fn test_closed_with_cost_is_terminal() {
        let mut order = market_entry(dec!(10));
        order.status = ExchangeOrderStatus::Closed;
        order.cost = dec!(500);
        assert!(order.is_terminal());
    }

    #[test]
    fn test_closed_without_cost_is_not_terminal() {
        // Exchange says closed but no cost reported yet: keep rechecking.
        let mut order = market_entry(dec!(10));
        order.status = ExchangeOrderStatus::Closed;
        assert!(!order.is_terminal());
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let mut order = market_entry(dec!(10));
        order.status = ExchangeOrderStatus::Canceled;
        assert!(order.is_terminal());
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }
}
