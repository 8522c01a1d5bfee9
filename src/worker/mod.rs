//! Per-queue consumption loop.
//!
//! Glue between the broker, the lock manager and the lifecycle components:
//! pop a work item, take the hard lock for its position, dispatch to
//! reconciliation or exit handling, release the lock on every path, then
//! ack or requeue. No error escapes the loop: every inbound message is
//! acked or nacked exactly once.

pub mod shutdown;

pub use shutdown::ShutdownFlag;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::context::EngineContext;
use crate::domain::{Position, PositionStatus, Queue, QueueMessage, Side};
use crate::error::{EngineError, Result};
use crate::exit::ExitCoordinator;
use crate::locking::LockManager;
use crate::monitor::{OrderMonitor, ReconcileOptions};
use crate::triggers::{TriggerClass, TriggerKind, TriggerMember};

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages acked, including irrelevant and terminally failed ones
    pub processed: u64,
    /// Messages nacked back to their queue after a transient failure
    pub requeued: u64,
    /// Malformed messages and ones past the redelivery budget
    pub dropped: u64,
}

pub struct WorkerRuntime {
    ctx: EngineContext,
    locks: Arc<LockManager>,
    monitor: OrderMonitor,
    exit: ExitCoordinator,
    config: WorkerConfig,
    shutdown: ShutdownFlag,
}

impl WorkerRuntime {
    pub fn new(
        ctx: EngineContext,
        locks: Arc<LockManager>,
        monitor: OrderMonitor,
        exit: ExitCoordinator,
        config: WorkerConfig,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            ctx,
            locks,
            monitor,
            exit,
            config,
            shutdown,
        }
    }

    /// Consume until the shutdown flag trips.
    pub async fn run(&self) -> Result<WorkerStats> {
        let queues = self.consumed_queues()?;
        info!(
            process = %self.config.process_name,
            queues = ?self.config.queues,
            "worker started"
        );

        let mut stats = WorkerStats::default();
        while !self.shutdown.is_triggered() {
            if let Err(err) = self.poll_once(&queues, &mut stats).await {
                // Broker hiccup; back off instead of dying.
                error!(error = %err, "queue poll failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        info!(
            process = %self.config.process_name,
            processed = stats.processed,
            requeued = stats.requeued,
            dropped = stats.dropped,
            "worker stopped"
        );
        Ok(stats)
    }

    fn consumed_queues(&self) -> Result<Vec<Queue>> {
        self.config
            .queues
            .iter()
            .map(|name| name.parse())
            .collect()
    }

    /// One pass over the consumed queues, handling at most one message per
    /// queue.
    pub async fn poll_once(&self, queues: &[Queue], stats: &mut WorkerStats) -> Result<()> {
        for queue in queues {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            let popped = self
                .ctx
                .store
                .queue_pop(
                    queue.as_str(),
                    Duration::from_secs(self.config.consume_timeout_secs),
                )
                .await?;
            if let Some(payload) = popped {
                self.handle_payload(*queue, &payload, stats).await;
            }
        }
        Ok(())
    }

    /// Decode, process, and settle one inbound message. Never returns an
    /// error: the ack/nack decision is the error handling.
    async fn handle_payload(&self, queue: Queue, payload: &str, stats: &mut WorkerStats) {
        let message: QueueMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    queue = queue.as_str(),
                    error = %err,
                    payload,
                    "dropping malformed message"
                );
                stats.dropped += 1;
                return;
            }
        };

        match self.process(queue, &message).await {
            Ok(()) => stats.processed += 1,
            Err(err) if err.is_requeueable() => {
                let redelivered = message.redelivered();
                if redelivered.redeliveries > self.config.max_redeliveries {
                    error!(
                        queue = queue.as_str(),
                        position_id = %message.position_id,
                        redeliveries = message.redeliveries,
                        error = %err,
                        "redelivery budget exhausted, dropping message"
                    );
                    stats.dropped += 1;
                    return;
                }
                warn!(
                    queue = queue.as_str(),
                    position_id = %message.position_id,
                    redeliveries = redelivered.redeliveries,
                    error = %err,
                    "transient failure, requeueing message"
                );
                match self.ctx.outbox.enqueue(queue, &redelivered).await {
                    Ok(()) => stats.requeued += 1,
                    Err(push_err) => {
                        error!(
                            queue = queue.as_str(),
                            position_id = %message.position_id,
                            error = %push_err,
                            "requeue failed, message lost"
                        );
                        stats.dropped += 1;
                    }
                }
            }
            Err(EngineError::Authentication {
                connection_id,
                reason,
            }) => {
                error!(
                    connection_id = %connection_id,
                    position_id = %message.position_id,
                    reason,
                    "authentication failure, closing all positions on connection"
                );
                if let Err(close_err) = self.exit.close_all_for_connection(&connection_id).await {
                    error!(
                        connection_id = %connection_id,
                        error = %close_err,
                        "close-all after authentication failure did not complete"
                    );
                }
                stats.processed += 1;
            }
            Err(err) => {
                error!(
                    queue = queue.as_str(),
                    position_id = %message.position_id,
                    error = %err,
                    "message failed terminally, acking"
                );
                stats.processed += 1;
            }
        }
    }

    /// Lock, dispatch, and always release.
    async fn process(&self, queue: Queue, message: &QueueMessage) -> Result<()> {
        let id = &message.position_id;
        let Some(lock) = self.locks.acquire_hard("positions", id).await? else {
            return Err(EngineError::LockAcquisitionTimeout {
                resource: format!("positions:{id}"),
            });
        };

        let result = self.dispatch(queue, message).await;

        if let Err(err) = self.ctx.positions.unlock(id, &self.config.process_name).await {
            warn!(position_id = %id, error = %err, "legacy flag unlock failed");
        }
        if let Err(err) = self.locks.release_hard(&lock).await {
            warn!(position_id = %id, error = %err, "hard lock release failed");
        }
        result
    }

    async fn dispatch(&self, queue: Queue, message: &QueueMessage) -> Result<()> {
        let id = &message.position_id;
        debug!(
            queue = queue.as_str(),
            position_id = %id,
            status = message.status,
            "dispatching work item"
        );
        if self.ctx.positions.get(id).await?.is_none() {
            debug!(position_id = %id, "message for unknown position, acking");
            return Ok(());
        }
        let Some(position) = self
            .ctx
            .positions
            .get_and_lock(id, &self.config.process_name)
            .await?
        else {
            // Legacy flag left behind by a crashed worker; the hard lock is
            // authoritative, so retry once the flag's owner is cleaned up.
            warn!(position_id = %id, "position flagged by another owner, requeueing");
            return Err(EngineError::LockAcquisitionTimeout {
                resource: format!("positions:{id}"),
            });
        };
        if position.closed {
            debug!(position_id = %id, "position already closed, acking");
            return Ok(());
        }

        // The lifecycle code on the message decides the handler; the queue
        // name only decides who consumes it.
        match PositionStatus::from_code(message.status)? {
            PositionStatus::Exiting => {
                self.exit.close_locked(position, message).await?;
            }
            PositionStatus::StopLossPending => {
                self.arm_stop(&position, message).await?;
            }
            PositionStatus::TakeProfitPending => {
                self.arm_take_profits(&position).await?;
                self.monitor
                    .reconcile(
                        position,
                        &ReconcileOptions {
                            force_recheck: true,
                            extreme_price: message.limit_price,
                        },
                    )
                    .await?;
            }
            _ => {
                self.monitor
                    .reconcile(
                        position,
                        &ReconcileOptions {
                            force_recheck: true,
                            extreme_price: message.limit_price,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Arm the stop trigger. Its destination is the exit queue: a stop hit
    /// is a full close, delivered as an `Exiting` work item.
    async fn arm_stop(&self, position: &Position, message: &QueueMessage) -> Result<()> {
        let Some(stop_price) = message.limit_price.or(position.stop_price) else {
            debug!(position_id = %position.id, "no stop price configured, acking");
            return Ok(());
        };
        if message.limit_price.is_some() && message.limit_price != position.stop_price {
            // Trailing stop ratchet: persist the new level before re-arming.
            self.ctx
                .positions
                .update(
                    &position.id,
                    crate::domain::PositionUpdate {
                        stop_price: Some(stop_price),
                        ..Default::default()
                    },
                    false,
                )
                .await?;
        }
        let class = match position.side {
            Side::Long => TriggerClass::Lte,
            Side::Short => TriggerClass::Gte,
        };
        let member = TriggerMember {
            kind: TriggerKind::Target,
            ref_id: "stop".to_string(),
            position_id: position.id.clone(),
            queue: Queue::ExitPosition,
            status: PositionStatus::Exiting.code(),
        };
        self.ctx
            .triggers
            .arm(&position.market, class, &member, Some(stop_price))
            .await
    }

    /// Arm one trigger per unresolved take-profit target. Firing delivers a
    /// `TakeProfitPending` work item, which re-arms idempotently and
    /// reconciles.
    async fn arm_take_profits(&self, position: &Position) -> Result<()> {
        let class = match position.side {
            Side::Long => TriggerClass::Gte,
            Side::Short => TriggerClass::Lte,
        };
        for target in position
            .take_profit_targets
            .iter()
            .filter(|t| !t.is_resolved())
        {
            let Some(price) = target.trigger_price(position.avg_price) else {
                continue;
            };
            let member = TriggerMember {
                kind: TriggerKind::Target,
                ref_id: target.target_id.clone(),
                position_id: position.id.clone(),
                queue: Queue::TakeProfit,
                status: PositionStatus::TakeProfitPending.code(),
            };
            self.ctx
                .triggers
                .arm(&position.market, class, &member, Some(price))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::{FillOutcome, MockAccounting};
    use crate::config::{ExitConfig, LockConfig, MonitorConfig};
    use crate::domain::{
        ExchangeOrderStatus, Order, OrderKind, OrderSide, OrderType, Position, PositionStatus,
    };
    use crate::exchange::{ExchangeError, ExchangeErrorKind, MockExchangeAdapter, OrderSnapshot};
    use crate::store::{keys, KvStore, MemoryPositionStore, MemoryStore, PositionStore};
    use crate::testutil::test_position;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn fast_locks(store: Arc<MemoryStore>, name: &str) -> Arc<LockManager> {
        Arc::new(LockManager::new(
            store,
            name,
            LockConfig {
                ttl_secs: 5,
                poll_interval_ms: 10,
                max_attempts: 3,
            },
        ))
    }

    struct Harness {
        worker: WorkerRuntime,
        store: Arc<MemoryStore>,
        positions: Arc<MemoryPositionStore>,
    }

    fn harness(exchange: MockExchangeAdapter, accounting: MockAccounting) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let positions = Arc::new(MemoryPositionStore::new());
        let ctx = EngineContext::new(
            store.clone(),
            positions.clone(),
            Arc::new(exchange),
            Arc::new(accounting),
        );
        let locks = fast_locks(store.clone(), "worker-1");
        let monitor = OrderMonitor::new(ctx.clone(), MonitorConfig::default());
        let exit = ExitCoordinator::new(
            ctx.clone(),
            locks.clone(),
            OrderMonitor::new(ctx.clone(), MonitorConfig::default()),
            ExitConfig::default(),
            "worker-1",
        );
        let config = WorkerConfig {
            process_name: "worker-1".to_string(),
            queues: vec!["takeProfit".to_string(), "exitPosition".to_string()],
            consume_timeout_secs: 0,
            max_redeliveries: 2,
        };
        let worker = WorkerRuntime::new(ctx, locks, monitor, exit, config, ShutdownFlag::new());
        Harness {
            worker,
            store,
            positions,
        }
    }

    fn pending_entry_position(id: &str) -> Position {
        let mut position = test_position(id);
        position.status = PositionStatus::EntryPending;
        position.orders.insert(
            "ord-1".to_string(),
            Order::new(
                "ord-1",
                OrderKind::Entry,
                OrderType::Market,
                OrderSide::Buy,
                None,
                dec!(10),
            ),
        );
        position
    }

    fn filled_entry_snapshot() -> OrderSnapshot {
        OrderSnapshot {
            order_id: "ord-1".to_string(),
            status: ExchangeOrderStatus::Closed,
            order_type: OrderType::Market,
            side: OrderSide::Buy,
            price: None,
            average: Some(dec!(50)),
            amount: dec!(10),
            filled: dec!(10),
            cost: dec!(500),
        }
    }

    async fn push(store: &MemoryStore, queue: Queue, message: &QueueMessage) {
        store
            .queue_push(queue.as_str(), &serde_json::to_string(message).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_consume_dispatch_releases_lock_and_acks() {
        let mut exchange = MockExchangeAdapter::new();
        exchange.expect_supports().return_const(false);
        exchange
            .expect_get_order()
            .returning(|_, _| Ok(filled_entry_snapshot()));
        let mut accounting = MockAccounting::new();
        accounting.expect_apply_fill().returning(|_, _, _| {
            Ok(FillOutcome {
                amount: dec!(10),
                sold_amount: Decimal::ZERO,
                avg_price: Some(dec!(50)),
                fills_mismatch: false,
            })
        });
        accounting
            .expect_remaining_amount()
            .returning(|_| Ok(dec!(10)));

        let h = harness(exchange, accounting);
        h.positions.insert(pending_entry_position("pos-1")).await;
        push(&h.store, Queue::TakeProfit, &QueueMessage::new("pos-1", 300)).await;

        let mut stats = WorkerStats::default();
        h.worker
            .poll_once(&[Queue::TakeProfit], &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.requeued, 0);

        let position = h.positions.get("pos-1").await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Bought);
        assert!(position.locked_by.is_none(), "legacy flag must be cleared");
        assert!(
            h.store
                .get(&keys::hard_lock("positions", "pos-1"))
                .await
                .unwrap()
                .is_none(),
            "hard lock must be released"
        );
    }

    #[tokio::test]
    async fn test_lock_timeout_requeues_with_redelivery_counter() {
        let exchange = MockExchangeAdapter::new();
        let accounting = MockAccounting::new();
        let h = harness(exchange, accounting);
        h.positions.insert(pending_entry_position("pos-1")).await;

        // Another process holds the hard lock and never yields in time.
        let foreign = fast_locks(h.store.clone(), "foreign");
        let held = foreign
            .acquire_hard("positions", "pos-1")
            .await
            .unwrap()
            .unwrap();

        push(&h.store, Queue::TakeProfit, &QueueMessage::new("pos-1", 300)).await;
        let mut stats = WorkerStats::default();
        h.worker
            .poll_once(&[Queue::TakeProfit], &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.requeued, 1);
        let requeued: QueueMessage = serde_json::from_str(
            &h.store
                .queue_pop(Queue::TakeProfit.as_str(), Duration::from_millis(20))
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(requeued.redeliveries, 1);

        foreign.release_hard(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_redelivery_budget_bounds_requeues() {
        let exchange = MockExchangeAdapter::new();
        let accounting = MockAccounting::new();
        let h = harness(exchange, accounting);
        h.positions.insert(pending_entry_position("pos-1")).await;

        let foreign = fast_locks(h.store.clone(), "foreign");
        let _held = foreign
            .acquire_hard("positions", "pos-1")
            .await
            .unwrap()
            .unwrap();

        // Already at the budget; one more transient failure drops it.
        let mut message = QueueMessage::new("pos-1", 300);
        message.redeliveries = 2;
        push(&h.store, Queue::TakeProfit, &message).await;

        let mut stats = WorkerStats::default();
        h.worker
            .poll_once(&[Queue::TakeProfit], &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.dropped, 1);
        assert!(h
            .store
            .queue_pop(Queue::TakeProfit.as_str(), Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_settled() {
        let exchange = MockExchangeAdapter::new();
        let accounting = MockAccounting::new();
        let h = harness(exchange, accounting);

        h.store
            .queue_push(Queue::TakeProfit.as_str(), "{not json")
            .await
            .unwrap();
        push(&h.store, Queue::TakeProfit, &QueueMessage::new("ghost", 300)).await;

        let mut stats = WorkerStats::default();
        h.worker
            .poll_once(&[Queue::TakeProfit], &mut stats)
            .await
            .unwrap();
        h.worker
            .poll_once(&[Queue::TakeProfit], &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.dropped, 1, "malformed payload dropped");
        assert_eq!(stats.processed, 1, "unknown position acked");
    }

    #[tokio::test]
    async fn test_stop_placement_then_stop_hit_closes_position() {
        let mut exchange = MockExchangeAdapter::new();
        exchange.expect_supports().return_const(false);
        exchange
            .expect_check_value()
            .returning(|_, _, _, _| Ok(true));
        exchange
            .expect_to_precision()
            .returning(|_, value, _| Ok(value));
        exchange.expect_send_order().times(1).returning(|_, _| {
            Ok(OrderSnapshot {
                order_id: "exit-1".to_string(),
                status: ExchangeOrderStatus::Closed,
                order_type: OrderType::Market,
                side: OrderSide::Sell,
                price: None,
                average: Some(dec!(40)),
                amount: dec!(10),
                filled: dec!(10),
                cost: dec!(400),
            })
        });
        exchange.expect_get_order().returning(|_, order_id| {
            assert_eq!(order_id, "exit-1");
            Ok(OrderSnapshot {
                order_id: "exit-1".to_string(),
                status: ExchangeOrderStatus::Closed,
                order_type: OrderType::Market,
                side: OrderSide::Sell,
                price: None,
                average: Some(dec!(40)),
                amount: dec!(10),
                filled: dec!(10),
                cost: dec!(400),
            })
        });

        let mut accounting = MockAccounting::new();
        accounting
            .expect_remaining_amount()
            .returning(|p| Ok(p.amount - p.sold_amount));
        accounting.expect_apply_fill().returning(|_, _, _| {
            Ok(FillOutcome {
                amount: dec!(10),
                sold_amount: dec!(10),
                avg_price: Some(dec!(50)),
                fills_mismatch: false,
            })
        });

        let h = harness(exchange, accounting);
        let mut position = test_position("pos-1");
        position.status = PositionStatus::Bought;
        position.amount = dec!(10);
        position.avg_price = Some(dec!(50));
        position.stop_price = Some(dec!(40));
        let market = position.market.clone();
        h.positions.insert(position).await;

        // Phase 1: placement message arms the stop trigger.
        push(
            &h.store,
            Queue::StopLoss,
            &QueueMessage::new("pos-1", PositionStatus::StopLossPending.code()),
        )
        .await;
        let mut stats = WorkerStats::default();
        h.worker
            .poll_once(&[Queue::StopLoss], &mut stats)
            .await
            .unwrap();
        assert_eq!(stats.processed, 1);

        // Phase 2: a tick below the stop fires the trigger into the exit
        // queue.
        let triggers = crate::triggers::PriceTriggerIndex::new(h.store.clone());
        assert_eq!(triggers.dispatch(&market, dec!(39)).await.unwrap(), 1);

        h.worker
            .poll_once(&[Queue::ExitPosition], &mut stats)
            .await
            .unwrap();

        let position = h.positions.get("pos-1").await.unwrap().unwrap();
        assert!(position.closed);
        assert!(position.sell_performed);
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_auth_failure_closes_every_position_on_connection() {
        let mut exchange = MockExchangeAdapter::new();
        exchange.expect_supports().return_const(false);
        exchange.expect_get_order().returning(|_, _| {
            Err(ExchangeError::new(
                ExchangeErrorKind::AuthRevoked,
                "key disabled",
            ))
        });
        let accounting = MockAccounting::new();

        let h = harness(exchange, accounting);
        h.positions.insert(pending_entry_position("pos-1")).await;
        let mut sibling = test_position("pos-2");
        sibling.status = PositionStatus::Bought;
        sibling.amount = dec!(5);
        h.positions.insert(sibling).await;

        push(&h.store, Queue::TakeProfit, &QueueMessage::new("pos-1", 300)).await;
        let mut stats = WorkerStats::default();
        h.worker
            .poll_once(&[Queue::TakeProfit], &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.processed, 1);
        for id in ["pos-1", "pos-2"] {
            let position = h.positions.get(id).await.unwrap().unwrap();
            assert!(position.closed, "{id} must be closed after auth failure");
            assert_eq!(position.status, PositionStatus::ClosedAuthRevoked);
        }
    }
}
