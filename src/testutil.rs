//! Shared unit-test fixtures.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::domain::{EntryMode, MarketRef, Position, PositionStatus, Side};

pub(crate) fn test_position(id: &str) -> Position {
    let now = Utc::now();
    Position {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        connection_id: "conn-1".to_string(),
        market: MarketRef {
            exchange: "binance".to_string(),
            market_type: "spot".to_string(),
            symbol: "BTC/USDT".to_string(),
        },
        side: Side::Long,
        entry_mode: EntryMode::Single,
        status: PositionStatus::Created,
        orders: BTreeMap::new(),
        take_profit_targets: Vec::new(),
        reentry_targets: Vec::new(),
        closed: false,
        sell_performed: false,
        exit_in_flight: false,
        avg_price: None,
        stop_price: None,
        amount: Decimal::ZERO,
        sold_amount: Decimal::ZERO,
        locked_by: None,
        last_update: now,
        created_at: now,
    }
}
