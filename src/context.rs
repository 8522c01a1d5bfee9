//! Shared collaborator bundle.
//!
//! Every component takes its dependencies through this context instead of
//! reaching for ambient globals; tests swap in mocks or the in-memory
//! backends wholesale.

use std::sync::Arc;

use crate::accounting::Accounting;
use crate::exchange::ExchangeAdapter;
use crate::outbox::Outbox;
use crate::store::{KvStore, PositionStore};
use crate::triggers::PriceTriggerIndex;

#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn KvStore>,
    pub positions: Arc<dyn PositionStore>,
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub accounting: Arc<dyn Accounting>,
    pub outbox: Outbox,
    pub triggers: PriceTriggerIndex,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn KvStore>,
        positions: Arc<dyn PositionStore>,
        exchange: Arc<dyn ExchangeAdapter>,
        accounting: Arc<dyn Accounting>,
    ) -> Self {
        Self {
            outbox: Outbox::new(store.clone()),
            triggers: PriceTriggerIndex::new(store.clone()),
            store,
            positions,
            exchange,
            accounting,
        }
    }
}
