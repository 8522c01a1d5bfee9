pub mod accounting;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod exit;
pub mod locking;
pub mod monitor;
pub mod outbox;
pub mod store;
pub mod triggers;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use accounting::{Accounting, FillOutcome, NaiveAccounting};
pub use config::AppConfig;
pub use context::EngineContext;
pub use error::{EngineError, Result};
pub use exchange::{ExchangeAdapter, ExchangeError, ExchangeErrorKind, PaperExchange};
pub use exit::ExitCoordinator;
pub use locking::{HardLock, LockKind, LockManager, SoftLock};
pub use monitor::{OrderMonitor, ReconcileOptions};
pub use outbox::Outbox;
pub use store::{KvStore, MemoryPositionStore, MemoryStore, PositionStore, RedisStore};
pub use triggers::{PriceTriggerIndex, TriggerClass, TriggerKind, TriggerMember};
pub use worker::{ShutdownFlag, WorkerRuntime, WorkerStats};
