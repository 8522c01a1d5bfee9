//! Accounting collaborator interface.
//!
//! Fee netting and average-price math are outside this crate. Reconciliation
//! hands over the authoritative order snapshot plus its trade fills and gets
//! back the position-level quantities to persist.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{Fill, Order, Position};
use crate::error::Result;

/// Position-level result of booking one filled order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillOutcome {
    /// Base amount acquired across the position after this fill
    pub amount: Decimal,
    /// Base amount disposed across the position after this fill
    pub sold_amount: Decimal,
    /// Realized average entry price
    pub avg_price: Option<Decimal>,
    /// Summed trade fills disagreed with the order's reported fill; the
    /// caller re-fetches and reconciles, bounded.
    pub fills_mismatch: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Accounting: Send + Sync {
    /// Book a filled order into the position's running quantities.
    async fn apply_fill(
        &self,
        position: &Position,
        order: &Order,
        fills: &[Fill],
    ) -> Result<FillOutcome>;

    /// Base amount still tradable (acquired minus disposed, fee-adjusted).
    async fn remaining_amount(&self, position: &Position) -> Result<Decimal>;
}

/// Reference implementation for paper runs and tests: plain quantity sums
/// and a cost-weighted entry average, no fee netting.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveAccounting;

#[async_trait]
impl Accounting for NaiveAccounting {
    async fn apply_fill(
        &self,
        position: &Position,
        order: &Order,
        fills: &[Fill],
    ) -> Result<FillOutcome> {
        let filled: Decimal = fills.iter().map(|f| f.amount).sum();
        let cost: Decimal = fills.iter().map(|f| f.cost).sum();
        let fills_mismatch =
            order.filled_amount > Decimal::ZERO && filled != order.filled_amount;

        let acquiring = order.side == position.side.entry_order_side();
        if acquiring {
            let amount = position.amount + filled;
            let prior_cost = position
                .avg_price
                .map(|avg| avg * position.amount)
                .unwrap_or(Decimal::ZERO);
            let avg_price = if amount > Decimal::ZERO {
                Some((prior_cost + cost) / amount)
            } else {
                position.avg_price
            };
            Ok(FillOutcome {
                amount,
                sold_amount: position.sold_amount,
                avg_price,
                fills_mismatch,
            })
        } else {
            Ok(FillOutcome {
                amount: position.amount,
                sold_amount: position.sold_amount + filled,
                avg_price: position.avg_price,
                fills_mismatch,
            })
        }
    }

    async fn remaining_amount(&self, position: &Position) -> Result<Decimal> {
        Ok(position.amount - position.sold_amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, OrderSide, OrderType};
    use crate::testutil::test_position;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn fill(amount: Decimal, cost: Decimal) -> Fill {
        Fill {
            trade_id: "t1".to_string(),
            order_id: "ord-1".to_string(),
            price: if amount > Decimal::ZERO {
                cost / amount
            } else {
                Decimal::ZERO
            },
            amount,
            cost,
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_entry_fill_updates_weighted_average() {
        let accounting = NaiveAccounting;
        let mut position = test_position("p1");
        position.amount = dec!(10);
        position.avg_price = Some(dec!(50));

        let order = Order::new(
            "ord-1",
            OrderKind::ReEntry,
            OrderType::Market,
            OrderSide::Buy,
            None,
            dec!(10),
        );
        let outcome = accounting
            .apply_fill(&position, &order, &[fill(dec!(10), dec!(400))])
            .await
            .unwrap();
        assert_eq!(outcome.amount, dec!(20));
        assert_eq!(outcome.avg_price, Some(dec!(45)));
        assert!(!outcome.fills_mismatch);
    }

    #[tokio::test]
    async fn test_disposal_fill_adds_to_sold_amount() {
        let accounting = NaiveAccounting;
        let mut position = test_position("p1");
        position.amount = dec!(10);
        position.avg_price = Some(dec!(50));

        let order = Order::new(
            "ord-2",
            OrderKind::TakeProfit,
            OrderType::Limit,
            OrderSide::Sell,
            Some(dec!(55)),
            dec!(4),
        );
        let outcome = accounting
            .apply_fill(&position, &order, &[fill(dec!(4), dec!(220))])
            .await
            .unwrap();
        assert_eq!(outcome.amount, dec!(10));
        assert_eq!(outcome.sold_amount, dec!(4));

        position.sold_amount = outcome.sold_amount;
        assert_eq!(
            accounting.remaining_amount(&position).await.unwrap(),
            dec!(6)
        );
    }

    #[tokio::test]
    async fn test_fill_sum_mismatch_is_flagged() {
        let accounting = NaiveAccounting;
        let position = test_position("p1");
        let mut order = Order::new(
            "ord-1",
            OrderKind::Entry,
            OrderType::Market,
            OrderSide::Buy,
            None,
            dec!(10),
        );
        order.filled_amount = dec!(10);

        let outcome = accounting
            .apply_fill(&position, &order, &[fill(dec!(7), dec!(350))])
            .await
            .unwrap();
        assert!(outcome.fills_mismatch);
    }
}
