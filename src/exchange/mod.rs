//! Exchange adapter collaborator interface.
//!
//! Connectivity, request signing and venue quirks live behind this trait;
//! the engine only sees domain values or a tagged error envelope. Venues
//! that lack an operation answer `supports()` with false instead of
//! throwing, and callers check before invoking.

pub mod paper;

pub use paper::PaperExchange;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ExchangeOrderStatus, Fill, OrderSide, OrderType, Position};

/// Classification carried on every adapter error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeErrorKind {
    // Transient: retry next cycle
    RateLimited,
    Timeout,
    /// Request timestamp outside the exchange's receive window
    ClockSkew,
    /// Momentary "unknown order" right after submission
    OrderNotFound,
    Network,
    // Authentication: closes every position on the connection
    InvalidKey,
    AuthRevoked,
    // Business rules: close the affected position
    InsufficientFunds,
    BelowMinimum,
    Rejected,
    Other,
}

impl ExchangeErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::ClockSkew | Self::OrderNotFound | Self::Network
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::InvalidKey | Self::AuthRevoked)
    }

    pub fn is_business(&self) -> bool {
        matches!(self, Self::InsufficientFunds | Self::BelowMinimum | Self::Rejected)
    }
}

/// Tagged error envelope returned by every adapter operation
#[derive(Debug, Clone, Error)]
#[error("exchange error ({kind:?}): {message}")]
pub struct ExchangeError {
    pub kind: ExchangeErrorKind,
    pub message: String,
}

impl ExchangeError {
    pub fn new(kind: ExchangeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Lift into the engine taxonomy for the connection the call ran on.
    pub fn into_engine(self, connection_id: &str) -> crate::error::EngineError {
        use crate::domain::PositionStatus;
        use crate::error::EngineError;

        match self.kind {
            kind if kind.is_transient() => EngineError::TransientExchange(self.message),
            kind if kind.is_auth() => EngineError::Authentication {
                connection_id: connection_id.to_string(),
                reason: self.message,
            },
            ExchangeErrorKind::InsufficientFunds => EngineError::BusinessRule {
                status_code: PositionStatus::ClosedInsufficientFunds.code(),
                reason: self.message,
            },
            ExchangeErrorKind::BelowMinimum => EngineError::BusinessRule {
                status_code: PositionStatus::ClosedBelowMinimum.code(),
                reason: self.message,
            },
            _ => EngineError::BusinessRule {
                status_code: PositionStatus::ClosedError.code(),
                reason: self.message,
            },
        }
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Capabilities a venue may or may not offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Per-order trade fills can be fetched
    FetchTrades,
    /// Market orders above the max chunk can be split client-side
    ChunkedMarketOrders,
}

/// Authoritative order state as reported by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub status: ExchangeOrderStatus,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub price: Option<Decimal>,
    pub average: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub cost: Decimal,
}

/// New order submission
#[derive(Debug, Clone)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
}

/// What `check_value` validates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Amount,
    Cost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionKind {
    Price,
    Amount,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn supports(&self, feature: Feature) -> bool;

    async fn get_order(&self, position: &Position, order_id: &str)
        -> ExchangeResult<OrderSnapshot>;

    async fn cancel_order(&self, position: &Position, order_id: &str) -> ExchangeResult<()>;

    async fn send_order(
        &self,
        position: &Position,
        request: NewOrderRequest,
    ) -> ExchangeResult<OrderSnapshot>;

    async fn get_trades(&self, position: &Position, order_id: &str) -> ExchangeResult<Vec<Fill>>;

    /// Is `value` acceptable for the venue's bound of that kind?
    async fn check_value(
        &self,
        kind: ValueKind,
        bound: BoundKind,
        value: Decimal,
        symbol: &str,
    ) -> ExchangeResult<bool>;

    async fn to_precision(
        &self,
        kind: PrecisionKind,
        value: Decimal,
        symbol: &str,
    ) -> ExchangeResult<Decimal>;

    /// Largest market-order amount the venue accepts in one submission,
    /// if it advertises one.
    async fn max_market_amount(&self, symbol: &str) -> ExchangeResult<Option<Decimal>>;
}
