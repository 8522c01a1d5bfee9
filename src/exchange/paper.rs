//! Paper-trading venue.
//!
//! Backs demo runs and integration tests: market orders fill instantly at
//! the mark price, limit orders rest until a tick crosses them. No balances
//! and no trade history; the synthetic-fill path covers accounting input.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{
    BoundKind, ExchangeAdapter, ExchangeError, ExchangeErrorKind, ExchangeResult, Feature,
    NewOrderRequest, OrderSnapshot, PrecisionKind, ValueKind,
};
use crate::domain::{ExchangeOrderStatus, Fill, OrderSide, OrderType, Position};

pub struct PaperExchange {
    mark_price: Mutex<Decimal>,
    orders: Mutex<HashMap<String, OrderSnapshot>>,
    seq: AtomicU64,
}

impl PaperExchange {
    pub fn new(mark_price: Decimal) -> Self {
        Self {
            mark_price: Mutex::new(mark_price),
            orders: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub async fn mark_price(&self) -> Decimal {
        *self.mark_price.lock().await
    }

    /// Move the mark and fill resting limit orders the new price crosses.
    pub async fn tick(&self, price: Decimal) {
        *self.mark_price.lock().await = price;
        let mut orders = self.orders.lock().await;
        for snapshot in orders.values_mut() {
            if snapshot.status != ExchangeOrderStatus::Open
                || snapshot.order_type != OrderType::Limit
            {
                continue;
            }
            let Some(limit) = snapshot.price else { continue };
            let crossed = match snapshot.side {
                OrderSide::Buy => price <= limit,
                OrderSide::Sell => price >= limit,
            };
            if crossed {
                snapshot.status = ExchangeOrderStatus::Closed;
                snapshot.filled = snapshot.amount;
                snapshot.cost = snapshot.amount * limit;
                snapshot.average = Some(limit);
            }
        }
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn supports(&self, _feature: Feature) -> bool {
        false
    }

    async fn get_order(
        &self,
        _position: &Position,
        order_id: &str,
    ) -> ExchangeResult<OrderSnapshot> {
        self.orders
            .lock()
            .await
            .get(order_id)
            .cloned()
            .ok_or_else(|| {
                ExchangeError::new(
                    ExchangeErrorKind::OrderNotFound,
                    format!("unknown order {order_id}"),
                )
            })
    }

    async fn cancel_order(&self, _position: &Position, order_id: &str) -> ExchangeResult<()> {
        let mut orders = self.orders.lock().await;
        let Some(snapshot) = orders.get_mut(order_id) else {
            return Err(ExchangeError::new(
                ExchangeErrorKind::OrderNotFound,
                format!("unknown order {order_id}"),
            ));
        };
        if snapshot.status == ExchangeOrderStatus::Open {
            snapshot.status = ExchangeOrderStatus::Canceled;
        }
        Ok(())
    }

    async fn send_order(
        &self,
        _position: &Position,
        request: NewOrderRequest,
    ) -> ExchangeResult<OrderSnapshot> {
        let mark = *self.mark_price.lock().await;
        let order_id = self.next_order_id();
        let snapshot = match request.order_type {
            OrderType::Market => OrderSnapshot {
                order_id: order_id.clone(),
                status: ExchangeOrderStatus::Closed,
                order_type: OrderType::Market,
                side: request.side,
                price: None,
                average: Some(mark),
                amount: request.amount,
                filled: request.amount,
                cost: request.amount * mark,
            },
            OrderType::Limit => OrderSnapshot {
                order_id: order_id.clone(),
                status: ExchangeOrderStatus::Open,
                order_type: OrderType::Limit,
                side: request.side,
                price: request.price,
                average: None,
                amount: request.amount,
                filled: Decimal::ZERO,
                cost: Decimal::ZERO,
            },
        };
        self.orders
            .lock()
            .await
            .insert(order_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn get_trades(&self, _position: &Position, _order_id: &str) -> ExchangeResult<Vec<Fill>> {
        Err(ExchangeError::new(
            ExchangeErrorKind::Other,
            "paper venue keeps no trade history",
        ))
    }

    async fn check_value(
        &self,
        _kind: ValueKind,
        _bound: BoundKind,
        _value: Decimal,
        _symbol: &str,
    ) -> ExchangeResult<bool> {
        Ok(true)
    }

    async fn to_precision(
        &self,
        _kind: PrecisionKind,
        value: Decimal,
        _symbol: &str,
    ) -> ExchangeResult<Decimal> {
        Ok(value)
    }

    async fn max_market_amount(&self, _symbol: &str) -> ExchangeResult<Option<Decimal>> {
        Ok(None)
    }
}
