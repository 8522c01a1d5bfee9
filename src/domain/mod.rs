pub mod message;
pub mod order;
pub mod position;

pub use message::{NotificationCommand, Queue, QueueMessage};
pub use order::{ExchangeOrderStatus, Fill, Order, OrderKind, OrderSide, OrderType};
pub use position::{
    EntryMode, MarketRef, Position, PositionStatus, PositionUpdate, Side, Target, TargetKind,
};
