//! Position exit orchestration.
//!
//! Fully closes a locked position: cancel whatever still rests on the book,
//! recompute the tradable remainder, and market-sell it on the opposite
//! side in venue-accepted chunks. Submission failures are classified
//! retryable (requeue the same exit request, bounded attempts in total) or
//! terminal (close immediately with an error status). A remainder below the
//! venue minimum closes directly at the last known average price.

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::ExitConfig;
use crate::context::EngineContext;
use crate::domain::{
    Order, OrderKind, OrderType, Position, PositionStatus, PositionUpdate, Queue, QueueMessage,
};
use crate::error::{EngineError, Result};
use crate::exchange::{
    BoundKind, ExchangeErrorKind, Feature, NewOrderRequest, PrecisionKind, ValueKind,
};
use crate::locking::LockManager;
use crate::monitor::{dust, OrderMonitor, ReconcileOptions};

pub struct ExitCoordinator {
    ctx: EngineContext,
    locks: std::sync::Arc<LockManager>,
    monitor: OrderMonitor,
    config: ExitConfig,
    process_name: String,
}

impl ExitCoordinator {
    pub fn new(
        ctx: EngineContext,
        locks: std::sync::Arc<LockManager>,
        monitor: OrderMonitor,
        config: ExitConfig,
        process_name: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            locks,
            monitor,
            config,
            process_name: process_name.into(),
        }
    }

    /// Close a position the caller already holds the hard lock for.
    ///
    /// `message` carries the submission attempt counter; the same request is
    /// requeued verbatim (attempt + 1) on a retryable failure.
    pub async fn close_locked(
        &self,
        position: Position,
        message: &QueueMessage,
    ) -> Result<Position> {
        if position.closed {
            debug!(position_id = %position.id, "exit requested for closed position, nothing to do");
            return Ok(position);
        }
        // A fresh exit request yields to one already being orchestrated;
        // our own requeued retries carry a nonzero counter and proceed.
        if position.exit_in_flight && message.attempt == 0 && message.redeliveries == 0 {
            debug!(position_id = %position.id, "exit already in flight, skipping");
            return Ok(position);
        }

        let position = self
            .ctx
            .positions
            .update(
                &position.id,
                PositionUpdate {
                    status: Some(PositionStatus::Exiting),
                    exit_in_flight: Some(true),
                    ..Default::default()
                },
                true,
            )
            .await?;

        self.cancel_open_orders(&position).await?;

        let remaining = self.ctx.accounting.remaining_amount(&position).await?;
        if remaining <= dust() {
            return self.monitor.close(position, PositionStatus::Closed).await;
        }

        let symbol = position.market.symbol.clone();
        let sellable = self
            .ctx
            .exchange
            .check_value(ValueKind::Amount, BoundKind::Min, remaining, &symbol)
            .await
            .map_err(|e| e.into_engine(&position.connection_id))?;
        if !sellable {
            info!(
                position_id = %position.id,
                %remaining,
                "remainder below venue minimum, closing at last average price"
            );
            return self.monitor.close(position, PositionStatus::Closed).await;
        }

        self.submit_market_close(position, remaining, message).await
    }

    /// Acquire the lock for one position and close it.
    pub async fn close_position(&self, id: &str) -> Result<Position> {
        let Some(lock) = self.locks.acquire_hard("positions", id).await? else {
            return Err(EngineError::LockAcquisitionTimeout {
                resource: format!("positions:{id}"),
            });
        };
        let result = self.close_position_inner(id).await;
        self.ctx.positions.unlock(id, &self.process_name).await?;
        self.locks.release_hard(&lock).await?;
        result
    }

    async fn close_position_inner(&self, id: &str) -> Result<Position> {
        let Some(position) = self
            .ctx
            .positions
            .get_and_lock(id, &self.process_name)
            .await?
        else {
            return Err(EngineError::PositionNotFound(id.to_string()));
        };
        self.close_locked(position, &QueueMessage::new(id, PositionStatus::Exiting.code()))
            .await
    }

    /// Close every open position under an exchange connection whose
    /// credentials stopped working. No orders are submitted: the venue will
    /// not accept them anymore.
    pub async fn close_all_for_connection(&self, connection_id: &str) -> Result<usize> {
        let ids = self
            .ctx
            .positions
            .open_position_ids_for_connection(connection_id)
            .await?;
        warn!(
            connection_id,
            positions = ids.len(),
            "closing all positions after authentication failure"
        );
        let mut closed = 0;
        for id in &ids {
            match self.close_revoked(id).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(position_id = %id, error = %err, "failed to close position on revoked connection");
                }
            }
        }
        Ok(closed)
    }

    async fn close_revoked(&self, id: &str) -> Result<bool> {
        let Some(lock) = self.locks.acquire_hard("positions", id).await? else {
            return Err(EngineError::LockAcquisitionTimeout {
                resource: format!("positions:{id}"),
            });
        };
        let result = async {
            let Some(position) = self
                .ctx
                .positions
                .get_and_lock(id, &self.process_name)
                .await?
            else {
                return Ok(false);
            };
            if position.closed {
                return Ok(false);
            }
            self.monitor
                .close(position, PositionStatus::ClosedAuthRevoked)
                .await?;
            Ok(true)
        }
        .await;
        self.ctx.positions.unlock(id, &self.process_name).await?;
        self.locks.release_hard(&lock).await?;
        result
    }

    async fn cancel_open_orders(&self, position: &Position) -> Result<()> {
        let open: Vec<String> = position
            .open_orders()
            .map(|o| o.order_id.clone())
            .collect();
        for order_id in open {
            match self.ctx.exchange.cancel_order(position, &order_id).await {
                Ok(()) => {
                    debug!(position_id = %position.id, %order_id, "cancelled pending order");
                }
                // Already gone on the venue side.
                Err(err) if err.kind == ExchangeErrorKind::OrderNotFound => {}
                Err(err) if err.kind.is_transient() || err.kind.is_auth() => {
                    return Err(err.into_engine(&position.connection_id));
                }
                Err(err) => {
                    warn!(
                        position_id = %position.id,
                        %order_id,
                        error = %err,
                        "cancel failed, continuing exit"
                    );
                }
            }
        }
        Ok(())
    }

    async fn submit_market_close(
        &self,
        mut position: Position,
        remaining: Decimal,
        message: &QueueMessage,
    ) -> Result<Position> {
        let symbol = position.market.symbol.clone();
        let side = position.side.exit_order_side();
        let chunks = self.chunk_amounts(remaining, &symbol, &position).await?;
        let mut any_filled = false;

        for chunk in chunks {
            let request = NewOrderRequest {
                symbol: symbol.clone(),
                side,
                order_type: OrderType::Market,
                amount: chunk,
                price: None,
            };
            match self.ctx.exchange.send_order(&position, request).await {
                Ok(snapshot) => {
                    info!(
                        position_id = %position.id,
                        user_id = %position.user_id,
                        order_id = %snapshot.order_id,
                        amount = %chunk,
                        "market close order submitted"
                    );
                    // Recorded as open; the reconciliation pass below (or
                    // the next cycle) books the fill authoritatively.
                    let order = Order::new(
                        snapshot.order_id.clone(),
                        OrderKind::Exit,
                        OrderType::Market,
                        side,
                        None,
                        chunk,
                    );
                    position = self
                        .ctx
                        .positions
                        .update(
                            &position.id,
                            PositionUpdate {
                                sell_performed: Some(true),
                                ..Default::default()
                            }
                            .with_order(order),
                            true,
                        )
                        .await?;
                    if snapshot.status == crate::domain::ExchangeOrderStatus::Closed {
                        any_filled = true;
                    }
                }
                Err(err) if err.kind.is_transient() => {
                    let next = message.next_attempt();
                    if next.attempt < self.config.max_attempts {
                        warn!(
                            position_id = %position.id,
                            attempt = next.attempt,
                            error = %err,
                            "retryable exit submission failure, requeueing"
                        );
                        self.ctx.outbox.enqueue(Queue::ExitPosition, &next).await?;
                        return Ok(position);
                    }
                    warn!(
                        position_id = %position.id,
                        attempts = self.config.max_attempts,
                        "exit submission budget exhausted"
                    );
                    return self
                        .monitor
                        .close(position, PositionStatus::ClosedExitError)
                        .await;
                }
                Err(err) if err.kind.is_auth() => {
                    return Err(err.into_engine(&position.connection_id));
                }
                Err(err) => {
                    let status = match err.kind {
                        ExchangeErrorKind::InsufficientFunds => {
                            PositionStatus::ClosedInsufficientFunds
                        }
                        ExchangeErrorKind::BelowMinimum => PositionStatus::ClosedBelowMinimum,
                        _ => PositionStatus::ClosedExitError,
                    };
                    warn!(position_id = %position.id, error = %err, "terminal exit submission failure");
                    return self.monitor.close(position, status).await;
                }
            }
        }

        if any_filled {
            // Finalize bookkeeping now instead of waiting for the next tick.
            position = self
                .monitor
                .reconcile(
                    position,
                    &ReconcileOptions {
                        force_recheck: true,
                        extreme_price: None,
                    },
                )
                .await?;
        }
        Ok(position)
    }

    /// Split the remainder into venue-accepted market-order sizes.
    async fn chunk_amounts(
        &self,
        remaining: Decimal,
        symbol: &str,
        position: &Position,
    ) -> Result<Vec<Decimal>> {
        let lift = |e: crate::exchange::ExchangeError| e.into_engine(&position.connection_id);
        let max = if self.ctx.exchange.supports(Feature::ChunkedMarketOrders) {
            self.ctx
                .exchange
                .max_market_amount(symbol)
                .await
                .map_err(lift)?
        } else {
            None
        };

        let mut chunks = Vec::new();
        let mut left = remaining;
        while left > dust() {
            let take = match max {
                Some(max) if left > max => max,
                _ => left,
            };
            let precise = self
                .ctx
                .exchange
                .to_precision(PrecisionKind::Amount, take, symbol)
                .await
                .map_err(lift)?;
            if precise <= Decimal::ZERO {
                break;
            }
            chunks.push(precise);
            left -= take;
        }
        Ok(chunks)
    }
}
