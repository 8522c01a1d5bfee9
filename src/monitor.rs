//! Order reconciliation state machine.
//!
//! Runs against a position the caller already holds the hard lock for.
//! Every non-terminal order is compared to the venue's authoritative state:
//! fills are booked through the accounting collaborator and fan out
//! downstream work, cancellations and fatal errors close the position
//! (except the losing leg of a MULTI entry), transient errors are deferred
//! to the next cycle with a bounded counter. Re-running reconciliation on an
//! already-terminal order mutates nothing.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::accounting::FillOutcome;
use crate::config::MonitorConfig;
use crate::context::EngineContext;
use crate::domain::{
    EntryMode, ExchangeOrderStatus, Fill, NotificationCommand, Order, OrderKind, OrderSide,
    OrderType, Position, PositionStatus, PositionUpdate, Queue, QueueMessage, Target,
};
use crate::error::{EngineError, Result};
use crate::exchange::{ExchangeError, Feature, OrderSnapshot};

/// Amounts at or below this are dust, not a tradable remainder.
pub(crate) fn dust() -> Decimal {
    dec!(0.00000001)
}

/// Per-invocation knobs supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Re-check every order regardless of the polling heuristic
    pub force_recheck: bool,
    /// Favorable extreme price seen since the last check, when the caller
    /// came from a price tick
    pub extreme_price: Option<Decimal>,
}

pub struct OrderMonitor {
    ctx: EngineContext,
    config: MonitorConfig,
}

impl OrderMonitor {
    pub fn new(ctx: EngineContext, config: MonitorConfig) -> Self {
        Self { ctx, config }
    }

    /// Reconcile every pending order of a locked position, returning the
    /// position as persisted after the pass.
    pub async fn reconcile(
        &self,
        position: Position,
        opts: &ReconcileOptions,
    ) -> Result<Position> {
        if position.closed {
            return Ok(position);
        }

        let mut position = position;
        let pending: Vec<String> = position
            .orders
            .values()
            .filter(|o| !o.is_terminal())
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in pending {
            let Some(order) = position.order(&order_id).cloned() else {
                continue;
            };
            if !self.should_recheck(&order, opts) {
                continue;
            }

            position = match self.ctx.exchange.get_order(&position, &order_id).await {
                Ok(snapshot) => self.apply_snapshot(position, order, snapshot).await?,
                Err(err) => self.handle_exchange_error(position, order, err).await?,
            };
            if position.closed {
                return Ok(position);
            }
        }

        // No explicit exit signal needed: once every order is resolved and
        // nothing tradable remains, the position is finished.
        if !position.orders.is_empty() && position.all_orders_done() {
            let remaining = self.ctx.accounting.remaining_amount(&position).await?;
            if remaining <= dust() {
                position = self.close(position, PositionStatus::Closed).await?;
            }
        }
        Ok(position)
    }

    /// Polling bound for limit orders; market orders are always re-checked.
    /// Never a correctness gate: a skipped order is picked up again by the
    /// max-age rule at the latest.
    fn should_recheck(&self, order: &Order, opts: &ReconcileOptions) -> bool {
        if order.order_type == OrderType::Market || opts.force_recheck {
            return true;
        }
        if matches!(order.kind, OrderKind::Entry | OrderKind::ReEntry) {
            return true;
        }
        match order.check_age_secs(Utc::now()) {
            None => return true,
            Some(age) if age >= self.config.recheck_max_age_secs as i64 => return true,
            Some(_) => {}
        }
        let (Some(extreme), Some(price)) = (opts.extreme_price, order.price) else {
            return false;
        };
        let tolerance = price * self.config.recheck_tolerance_pct;
        match order.side {
            OrderSide::Buy => extreme <= price + tolerance,
            OrderSide::Sell => extreme >= price - tolerance,
        }
    }

    async fn apply_snapshot(
        &self,
        position: Position,
        order: Order,
        snapshot: OrderSnapshot,
    ) -> Result<Position> {
        match snapshot.status {
            ExchangeOrderStatus::Open => self.record_checked(position, order, snapshot).await,
            // "closed" without cost is exchange lag; keep polling.
            ExchangeOrderStatus::Closed if snapshot.cost <= Decimal::ZERO => {
                self.record_checked(position, order, snapshot).await
            }
            ExchangeOrderStatus::Closed => self.handle_fill(position, order, snapshot).await,
            ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Expired => {
                info!(
                    position_id = %position.id,
                    order_id = %order.order_id,
                    status = ?snapshot.status,
                    "order resolved without fill"
                );
                self.resolve_failed_order(
                    position,
                    order,
                    snapshot.status,
                    format!("order {:?} on exchange", snapshot.status),
                    PositionStatus::ClosedError,
                )
                .await
            }
        }
    }

    /// Persist the authoritative still-open state and clear the transient
    /// counter.
    async fn record_checked(
        &self,
        position: Position,
        mut order: Order,
        snapshot: OrderSnapshot,
    ) -> Result<Position> {
        order.status = snapshot.status;
        order.filled_amount = snapshot.filled;
        order.transient_retries = 0;
        order.last_checked_at = Some(Utc::now());
        self.ctx
            .positions
            .update(&position.id, PositionUpdate::default().with_order(order), false)
            .await
    }

    async fn handle_fill(
        &self,
        position: Position,
        mut order: Order,
        snapshot: OrderSnapshot,
    ) -> Result<Position> {
        let fills = self.fetch_fills(&position, &order, &snapshot).await?;
        let outcome = self.book_fills(&position, &order, &snapshot, fills).await?;

        order.status = ExchangeOrderStatus::Closed;
        order.done = true;
        order.filled_amount = snapshot.filled;
        order.cost = snapshot.cost;
        order.price = snapshot.average.or(snapshot.price).or(order.price);
        order.transient_retries = 0;
        order.last_checked_at = Some(Utc::now());

        let mut update = PositionUpdate {
            amount: Some(outcome.amount),
            sold_amount: Some(outcome.sold_amount),
            avg_price: outcome.avg_price,
            ..Default::default()
        };
        if matches!(order.kind, OrderKind::Entry | OrderKind::ReEntry) {
            update.status = Some(PositionStatus::Bought);
        }
        if let Some(target_id) = order.target_id.clone() {
            match order.kind {
                OrderKind::TakeProfit => {
                    update.take_profit_targets =
                        mark_target_done(&position.take_profit_targets, &target_id);
                }
                OrderKind::ReEntry => {
                    update.reentry_targets =
                        mark_target_done(&position.reentry_targets, &target_id);
                }
                _ => {}
            }
        }
        let kind = order.kind;
        let filled = order.filled_amount;
        let update = update.with_order(order);
        let updated = self.ctx.positions.update(&position.id, update, true).await?;

        info!(
            position_id = %updated.id,
            user_id = %updated.user_id,
            kind = %kind,
            %filled,
            cost = %snapshot.cost,
            "order filled"
        );

        match kind {
            OrderKind::Entry | OrderKind::ReEntry => {
                self.fan_out_entry_fill(&updated, filled).await?;
                Ok(updated)
            }
            OrderKind::TakeProfit => {
                self.ctx
                    .outbox
                    .signal(&QueueMessage::new(&updated.id, updated.status.code()))
                    .await?;
                let remaining = self.ctx.accounting.remaining_amount(&updated).await?;
                if remaining <= dust() {
                    self.close(updated, PositionStatus::Closed).await
                } else {
                    Ok(updated)
                }
            }
            OrderKind::StopLoss | OrderKind::Exit => {
                // A chunked exit fills as several orders; close only once
                // the whole remainder is booked.
                let remaining = self.ctx.accounting.remaining_amount(&updated).await?;
                if remaining <= dust() {
                    self.close(updated, PositionStatus::Closed).await
                } else {
                    Ok(updated)
                }
            }
        }
    }

    /// Entry fill: the position is established, so arm the protective legs
    /// and propagate to copy-trade followers.
    async fn fan_out_entry_fill(&self, position: &Position, filled: Decimal) -> Result<()> {
        self.ctx
            .outbox
            .enqueue(
                Queue::TakeProfit,
                &QueueMessage::new(&position.id, PositionStatus::TakeProfitPending.code()),
            )
            .await?;
        self.ctx
            .outbox
            .enqueue(
                Queue::StopLoss,
                &QueueMessage::new(&position.id, PositionStatus::StopLossPending.code()),
            )
            .await?;
        self.ctx
            .outbox
            .signal(&QueueMessage::new(
                &position.id,
                PositionStatus::Bought.code(),
            ))
            .await?;
        self.ctx
            .outbox
            .notify(&NotificationCommand {
                command: "entryFilled".to_string(),
                user_id: position.user_id.clone(),
                position_id: position.id.clone(),
                params: json!({ "filled": filled }),
            })
            .await
    }

    /// Book fills through accounting, re-fetching a bounded number of times
    /// when the fill sum disagrees with the reported execution, and falling
    /// back to a corrective record synthesized from the order snapshot.
    async fn book_fills(
        &self,
        position: &Position,
        order: &Order,
        snapshot: &OrderSnapshot,
        mut fills: Vec<Fill>,
    ) -> Result<FillOutcome> {
        let mut outcome = self
            .ctx
            .accounting
            .apply_fill(position, order, &fills)
            .await?;
        let mut refetches = 0;
        while outcome.fills_mismatch && refetches < self.config.fill_refetch_attempts {
            refetches += 1;
            debug!(
                position_id = %position.id,
                order_id = %order.order_id,
                refetches,
                "fill sum mismatch, re-fetching trades"
            );
            fills = self.fetch_fills(position, order, snapshot).await?;
            outcome = self
                .ctx
                .accounting
                .apply_fill(position, order, &fills)
                .await?;
        }
        if outcome.fills_mismatch {
            warn!(
                position_id = %position.id,
                user_id = %position.user_id,
                order_id = %order.order_id,
                "fills still inconsistent after re-fetch, booking corrective record"
            );
            let corrective = vec![synthetic_fill(order, snapshot)];
            outcome = self
                .ctx
                .accounting
                .apply_fill(position, order, &corrective)
                .await?;
        }
        Ok(outcome)
    }

    async fn fetch_fills(
        &self,
        position: &Position,
        order: &Order,
        snapshot: &OrderSnapshot,
    ) -> Result<Vec<Fill>> {
        if !self.ctx.exchange.supports(Feature::FetchTrades) {
            return Ok(vec![synthetic_fill(order, snapshot)]);
        }
        self.ctx
            .exchange
            .get_trades(position, &order.order_id)
            .await
            .map_err(|err| err.into_engine(&position.connection_id))
    }

    async fn handle_exchange_error(
        &self,
        position: Position,
        mut order: Order,
        err: ExchangeError,
    ) -> Result<Position> {
        if err.kind.is_auth() {
            return Err(err.into_engine(&position.connection_id));
        }
        if err.kind.is_transient() {
            order.transient_retries += 1;
            if order.transient_retries <= self.config.max_transient_retries {
                debug!(
                    position_id = %position.id,
                    order_id = %order.order_id,
                    retries = order.transient_retries,
                    error = %err,
                    "transient exchange error, deferring order"
                );
                return self
                    .ctx
                    .positions
                    .update(&position.id, PositionUpdate::default().with_order(order), false)
                    .await;
            }
            warn!(
                position_id = %position.id,
                order_id = %order.order_id,
                "transient retry budget exhausted, resolving order as errored"
            );
            return self
                .resolve_failed_order(
                    position,
                    order,
                    ExchangeOrderStatus::Canceled,
                    err.message,
                    PositionStatus::ClosedError,
                )
                .await;
        }
        // Business failure on this order.
        let close_status = match err.clone().into_engine(&position.connection_id) {
            EngineError::BusinessRule { status_code, .. } => PositionStatus::from_code(status_code)
                .unwrap_or(PositionStatus::ClosedError),
            _ => PositionStatus::ClosedError,
        };
        self.resolve_failed_order(
            position,
            order,
            ExchangeOrderStatus::Canceled,
            err.message,
            close_status,
        )
        .await
    }

    /// Mark an order as terminally failed. Closes the position, except in
    /// MULTI entry mode where the sibling leg stays live and keeps racing.
    async fn resolve_failed_order(
        &self,
        position: Position,
        mut order: Order,
        status: ExchangeOrderStatus,
        error: String,
        close_status: PositionStatus,
    ) -> Result<Position> {
        let was_entry = matches!(order.kind, OrderKind::Entry);
        order.status = status;
        order.done = true;
        order.error = Some(error);
        order.last_checked_at = Some(Utc::now());

        let updated = self
            .ctx
            .positions
            .update(&position.id, PositionUpdate::default().with_order(order), true)
            .await?;

        if was_entry && updated.entry_mode == EntryMode::Multi && updated.live_entry_legs() > 0 {
            info!(
                position_id = %updated.id,
                "entry leg failed, sibling leg still racing"
            );
            return Ok(updated);
        }
        self.close(updated, close_status).await
    }

    /// Terminal transition: persist, tear down triggers, schedule settlement
    /// and tell the user. Exit handling funnels through here as well.
    pub(crate) async fn close(
        &self,
        position: Position,
        status: PositionStatus,
    ) -> Result<Position> {
        let updated = self
            .ctx
            .positions
            .update(&position.id, PositionUpdate::close_with(status), true)
            .await?;
        self.ctx
            .triggers
            .disarm_position(&updated.market, &updated.id)
            .await?;
        self.ctx
            .outbox
            .schedule_accounting(&updated.id, Utc::now())
            .await?;
        self.ctx
            .outbox
            .notify(&NotificationCommand {
                command: "positionClosed".to_string(),
                user_id: updated.user_id.clone(),
                position_id: updated.id.clone(),
                params: json!({ "status": status.code() }),
            })
            .await?;
        info!(
            position_id = %updated.id,
            user_id = %updated.user_id,
            status = status.code(),
            "position closed"
        );
        Ok(updated)
    }
}

fn mark_target_done(targets: &[Target], target_id: &str) -> Option<Vec<Target>> {
    let mut targets = targets.to_vec();
    for target in &mut targets {
        if target.target_id == target_id {
            target.done = true;
        }
    }
    Some(targets)
}

/// Corrective record derived from the order snapshot when per-trade fills
/// are unavailable or stay inconsistent.
fn synthetic_fill(order: &Order, snapshot: &OrderSnapshot) -> Fill {
    let price = snapshot.average.or(snapshot.price).unwrap_or_else(|| {
        if snapshot.filled > Decimal::ZERO {
            snapshot.cost / snapshot.filled
        } else {
            Decimal::ZERO
        }
    });
    Fill {
        trade_id: format!("synthetic-{}", order.order_id),
        order_id: order.order_id.clone(),
        price,
        amount: snapshot.filled,
        cost: snapshot.cost,
        fee: Decimal::ZERO,
        timestamp: Utc::now(),
    }
}
