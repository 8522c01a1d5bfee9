//! Per-symbol price trigger index.
//!
//! Keeps two sorted collections per `(exchange, market_type, symbol)`: one
//! for "due when price >= X" and one for "due when price <= X". A tick
//! consumer queries the slice on the matching side of the tick price and
//! fans each hit out to its destination queue. The index is a filter only:
//! reconciliation downstream re-validates everything, so a stale or missing
//! entry can delay or duplicate a re-check but never corrupt state.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{MarketRef, Queue, QueueMessage};
use crate::error::{EngineError, Result};
use crate::store::{keys, KvStore};

/// Which side of the tick price a trigger fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerClass {
    /// Due when tick price >= trigger price
    Gte,
    /// Due when tick price <= trigger price
    Lte,
}

impl TriggerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerClass::Gte => "gte",
            TriggerClass::Lte => "lte",
        }
    }

    /// Sentinel score that matches every tick, used for always-due entries
    /// (market orders, unconditional re-checks).
    fn sentinel_score(&self) -> f64 {
        match self {
            TriggerClass::Gte => 0.0,
            TriggerClass::Lte => f64::MAX,
        }
    }
}

/// What an index entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Order,
    Target,
    /// Unconditional position re-check
    Check,
}

impl TriggerKind {
    fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Order => "order",
            TriggerKind::Target => "target",
            TriggerKind::Check => "check",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "order" => Ok(TriggerKind::Order),
            "target" => Ok(TriggerKind::Target),
            "check" => Ok(TriggerKind::Check),
            other => Err(EngineError::InvalidMessage(format!(
                "unknown trigger kind: {other}"
            ))),
        }
    }
}

/// Sorted-set member payload, wire format `kind:refId:positionId:queue:status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMember {
    pub kind: TriggerKind,
    /// Order or target id the trigger is armed for
    pub ref_id: String,
    pub position_id: String,
    /// Queue the resulting work item is pushed to
    pub queue: Queue,
    /// Lifecycle code carried on the work item
    pub status: u16,
}

impl TriggerMember {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.kind.as_str(),
            self.ref_id,
            self.position_id,
            self.queue.as_str(),
            self.status
        )
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        let [kind, ref_id, position_id, queue, status] = parts.as_slice() else {
            return Err(EngineError::InvalidMessage(format!(
                "malformed trigger member: {raw}"
            )));
        };
        Ok(Self {
            kind: kind.parse()?,
            ref_id: ref_id.to_string(),
            position_id: position_id.to_string(),
            queue: queue.parse()?,
            status: status.parse().map_err(|_| {
                EngineError::InvalidMessage(format!("malformed trigger status: {raw}"))
            })?,
        })
    }
}

/// Price-indexed fan-out over the shared store.
#[derive(Clone)]
pub struct PriceTriggerIndex {
    store: Arc<dyn KvStore>,
}

impl PriceTriggerIndex {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn index_key(market: &MarketRef, class: TriggerClass) -> String {
        keys::trigger_index(
            &market.exchange,
            &market.market_type,
            &market.symbol,
            class.as_str(),
        )
    }

    /// Insert or re-score a trigger. `price = None` arms an always-due entry
    /// at the class sentinel score.
    pub async fn arm(
        &self,
        market: &MarketRef,
        class: TriggerClass,
        member: &TriggerMember,
        price: Option<Decimal>,
    ) -> Result<()> {
        let score = match price {
            Some(price) => price.to_f64().ok_or_else(|| {
                EngineError::InvalidMessage(format!("unrepresentable trigger price: {price}"))
            })?,
            None => class.sentinel_score(),
        };
        debug!(
            market = %market,
            class = class.as_str(),
            member = %member.encode(),
            score,
            "arming trigger"
        );
        self.store
            .zadd(&Self::index_key(market, class), &member.encode(), score)
            .await
    }

    /// Remove one trigger; true when it was armed.
    pub async fn disarm(
        &self,
        market: &MarketRef,
        class: TriggerClass,
        member: &TriggerMember,
    ) -> Result<bool> {
        self.store
            .zrem(&Self::index_key(market, class), &member.encode())
            .await
    }

    /// Drop every trigger for a position, on both sides. Called when the
    /// position closes.
    pub async fn disarm_position(&self, market: &MarketRef, position_id: &str) -> Result<usize> {
        let mut removed = 0;
        for class in [TriggerClass::Gte, TriggerClass::Lte] {
            let key = Self::index_key(market, class);
            for (raw, _) in self.store.zmembers(&key).await? {
                let matches = match TriggerMember::decode(&raw) {
                    Ok(member) => member.position_id == position_id,
                    // Garbage entries only cost cycles per tick; drop them.
                    Err(_) => {
                        warn!(key, member = raw.as_str(), "evicting malformed trigger");
                        true
                    }
                };
                if matches && self.store.zrem(&key, &raw).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Triggers due at `tick_price`, cheapest-first.
    pub async fn matches(
        &self,
        market: &MarketRef,
        class: TriggerClass,
        tick_price: Decimal,
    ) -> Result<Vec<TriggerMember>> {
        let tick = tick_price.to_f64().ok_or_else(|| {
            EngineError::InvalidMessage(format!("unrepresentable tick price: {tick_price}"))
        })?;
        let key = Self::index_key(market, class);
        let range = match class {
            TriggerClass::Gte => self.store.zrange_by_score(&key, 0.0, tick).await?,
            TriggerClass::Lte => self.store.zrange_by_score(&key, tick, f64::MAX).await?,
        };

        let mut due = Vec::with_capacity(range.len());
        for (raw, _) in range {
            match TriggerMember::decode(&raw) {
                Ok(member) => due.push(member),
                Err(_) => {
                    warn!(key, member = raw.as_str(), "evicting malformed trigger");
                    self.store.zrem(&key, &raw).await?;
                }
            }
        }
        Ok(due)
    }

    /// Fan out every trigger due at `tick_price` to its destination queue.
    /// Entries stay armed; reconciliation disarms them once resolved.
    pub async fn dispatch(&self, market: &MarketRef, tick_price: Decimal) -> Result<usize> {
        let mut dispatched = 0;
        for class in [TriggerClass::Gte, TriggerClass::Lte] {
            for member in self.matches(market, class, tick_price).await? {
                let message = QueueMessage::new(&member.position_id, member.status);
                let payload = serde_json::to_string(&message)?;
                self.store
                    .queue_push(member.queue.as_str(), &payload)
                    .await?;
                dispatched += 1;
            }
        }
        if dispatched > 0 {
            debug!(market = %market, %tick_price, dispatched, "trigger fan-out");
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn market() -> MarketRef {
        MarketRef {
            exchange: "binance".to_string(),
            market_type: "spot".to_string(),
            symbol: "BTC-USDT".to_string(),
        }
    }

    fn stop_loss_member(position_id: &str) -> TriggerMember {
        TriggerMember {
            kind: TriggerKind::Order,
            ref_id: "ord-1".to_string(),
            position_id: position_id.to_string(),
            queue: Queue::StopLoss,
            status: 310,
        }
    }

    fn index() -> (PriceTriggerIndex, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (PriceTriggerIndex::new(store.clone()), store)
    }

    #[test]
    fn test_member_wire_round_trip() {
        let member = stop_loss_member("pos-1");
        assert_eq!(member.encode(), "order:ord-1:pos-1:stopLoss:310");
        assert_eq!(TriggerMember::decode(&member.encode()).unwrap(), member);

        assert!(TriggerMember::decode("order:only-three:parts").is_err());
        assert!(TriggerMember::decode("order:r:p:stopLoss:notanumber").is_err());
        assert!(TriggerMember::decode("bogus:r:p:stopLoss:310").is_err());
    }

    #[tokio::test]
    async fn test_stop_loss_fires_below_not_above() {
        let (index, _) = index();
        let m = market();
        let member = stop_loss_member("pos-1");
        index
            .arm(&m, TriggerClass::Lte, &member, Some(dec!(40000)))
            .await
            .unwrap();

        let below = index
            .matches(&m, TriggerClass::Lte, dec!(39999.5))
            .await
            .unwrap();
        assert_eq!(below, vec![member.clone()]);

        let above = index
            .matches(&m, TriggerClass::Lte, dec!(40000.5))
            .await
            .unwrap();
        assert!(above.is_empty());

        // Exactly at the trigger price fires too.
        let at = index
            .matches(&m, TriggerClass::Lte, dec!(40000))
            .await
            .unwrap();
        assert_eq!(at.len(), 1);
    }

    #[tokio::test]
    async fn test_sentinel_always_due() {
        let (index, _) = index();
        let m = market();
        let member = TriggerMember {
            kind: TriggerKind::Check,
            ref_id: "ord-2".to_string(),
            position_id: "pos-1".to_string(),
            queue: Queue::TakeProfit,
            status: 300,
        };
        index.arm(&m, TriggerClass::Gte, &member, None).await.unwrap();

        for tick in [dec!(0.00001), dec!(1), dec!(9999999)] {
            let due = index.matches(&m, TriggerClass::Gte, tick).await.unwrap();
            assert_eq!(due, vec![member.clone()], "tick {tick}");
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_destination_queue() {
        let (index, store) = index();
        let m = market();
        index
            .arm(
                &m,
                TriggerClass::Lte,
                &stop_loss_member("pos-1"),
                Some(dec!(40000)),
            )
            .await
            .unwrap();
        let tp = TriggerMember {
            kind: TriggerKind::Target,
            ref_id: "t1".to_string(),
            position_id: "pos-1".to_string(),
            queue: Queue::TakeProfit,
            status: 300,
        };
        index
            .arm(&m, TriggerClass::Gte, &tp, Some(dec!(45000)))
            .await
            .unwrap();

        // Tick below the stop: only the stop-loss side fires.
        let dispatched = index.dispatch(&m, dec!(39000)).await.unwrap();
        assert_eq!(dispatched, 1);

        let payload = store
            .queue_pop(Queue::StopLoss.as_str(), std::time::Duration::from_millis(20))
            .await
            .unwrap()
            .expect("stop-loss message");
        let message: QueueMessage = serde_json::from_str(&payload).unwrap();
        assert_eq!(message.position_id, "pos-1");
        assert_eq!(message.status, 310);
        assert!(store
            .queue_pop(Queue::TakeProfit.as_str(), std::time::Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        // Dispatch does not consume the trigger.
        assert_eq!(index.dispatch(&m, dec!(39000)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rearm_moves_trigger_price() {
        let (index, _) = index();
        let m = market();
        let member = stop_loss_member("pos-1");
        index
            .arm(&m, TriggerClass::Lte, &member, Some(dec!(40000)))
            .await
            .unwrap();
        // Trailing stop ratchets up; arm again with the new price.
        index
            .arm(&m, TriggerClass::Lte, &member, Some(dec!(42000)))
            .await
            .unwrap();

        let due = index
            .matches(&m, TriggerClass::Lte, dec!(41000))
            .await
            .unwrap();
        assert_eq!(due.len(), 1, "only the re-scored entry exists");
        assert!(index
            .matches(&m, TriggerClass::Lte, dec!(42500))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_disarm_position_clears_both_sides() {
        let (index, store) = index();
        let m = market();
        index
            .arm(
                &m,
                TriggerClass::Lte,
                &stop_loss_member("pos-1"),
                Some(dec!(40000)),
            )
            .await
            .unwrap();
        let tp = TriggerMember {
            kind: TriggerKind::Target,
            ref_id: "t1".to_string(),
            position_id: "pos-1".to_string(),
            queue: Queue::TakeProfit,
            status: 300,
        };
        index
            .arm(&m, TriggerClass::Gte, &tp, Some(dec!(45000)))
            .await
            .unwrap();
        let other = stop_loss_member("pos-2");
        index
            .arm(&m, TriggerClass::Lte, &other, Some(dec!(41000)))
            .await
            .unwrap();
        // A malformed member sneaks in; the sweep drops it too.
        store
            .zadd(
                &PriceTriggerIndex::index_key(&m, TriggerClass::Lte),
                "garbage",
                1.0,
            )
            .await
            .unwrap();

        let removed = index.disarm_position(&m, "pos-1").await.unwrap();
        assert_eq!(removed, 3);

        let remaining = index
            .matches(&m, TriggerClass::Lte, dec!(0))
            .await
            .unwrap();
        assert_eq!(remaining, vec![other]);
        assert!(index
            .matches(&m, TriggerClass::Gte, dec!(100000))
            .await
            .unwrap()
            .is_empty());
    }
}
