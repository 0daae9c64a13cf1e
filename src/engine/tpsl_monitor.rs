//! Per-wallet loop that reconciles positions and fires TP/SL exits.

use super::wallet::WalletContext;
use crate::domain::{PositionState, TpSlKind};
use crate::error::EngineError;
use crate::notify::EngineEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one monitor tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub refreshed: usize,
    pub mismatches: usize,
    /// Positions skipped because no fresh price was available.
    pub stale: usize,
    pub triggered: usize,
    pub closed: usize,
}

#[derive(Debug, Clone)]
pub struct TpSlMonitor {
    ctx: Arc<WalletContext>,
    interval: Duration,
}

impl TpSlMonitor {
    pub fn new(ctx: Arc<WalletContext>, interval: Duration) -> Self {
        Self { ctx, interval }
    }

    /// One pass: refresh orders, reconcile, then evaluate every open rule.
    ///
    /// A rule that fires sets its `triggered` flag before the close is sent,
    /// so a position is closed at most once per trigger.
    pub async fn tick(&self) -> Result<MonitorReport, EngineError> {
        let ctx = &self.ctx;
        let mut report = MonitorReport::default();

        for machine in ctx.machines() {
            if machine.state().is_terminal() {
                continue;
            }
            ctx.prices().watch(machine.product_id());
            match machine.refresh().await {
                Ok(()) => report.refreshed += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(wallet = %ctx.id(), position_id = %machine.id(), error = %e, "Refresh failed"),
            }
        }

        let services = ctx.services();
        let venue_positions = services
            .call("get_positions", || services.venue.get_positions(&services.account))
            .await?;
        report.mismatches = ctx.reconcile(&venue_positions).await?.len();

        for machine in ctx.machines() {
            if machine.state() != PositionState::Open {
                continue;
            }
            let position = machine.position();
            let Some(snapshot) = ctx.prices().fresh(position.product_id) else {
                debug!(wallet = %ctx.id(), product = %position.product_id, "No fresh price, skipping");
                report.stale += 1;
                continue;
            };
            let price = snapshot.trigger_price();

            let hit = [TpSlKind::TakeProfit, TpSlKind::StopLoss]
                .into_iter()
                .filter_map(|kind| machine.active_rule(kind))
                .find(|rule| !rule.triggered && rule.is_hit(position.side, price));
            let Some(rule) = hit else {
                continue;
            };
            if !machine.mark_triggered(rule.kind).await? {
                continue;
            }
            report.triggered += 1;
            info!(
                wallet = %ctx.id(),
                position_id = %position.id,
                kind = %rule.kind,
                target = %rule.target_price,
                price = %price,
                "TP/SL triggered"
            );
            ctx.notifier().notify(EngineEvent::TpSlTriggered {
                wallet_id: ctx.id().clone(),
                position_id: position.id,
                product_id: position.product_id,
                kind: rule.kind,
                target_price: rule.target_price,
                trigger_price: price,
            });

            match machine.close().await {
                Ok(()) => {
                    if machine.state() == PositionState::Closed {
                        report.closed += 1;
                    }
                }
                Err(e) => {
                    warn!(wallet = %ctx.id(), position_id = %position.id, error = %e, "Triggered close failed");
                    machine.clear_trigger(rule.kind).await?;
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
        }

        ctx.prune_closed();
        Ok(report)
    }

    /// Tick until the wallet is halted or the engine shuts down.
    pub async fn run(self, cancel: CancellationToken) {
        info!(wallet = %self.ctx.id(), interval_ms = self.interval.as_millis() as u64, "TP/SL monitor started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(report) if report.triggered > 0 || report.mismatches > 0 => {
                    debug!(wallet = %self.ctx.id(), ?report, "Monitor tick");
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    warn!(wallet = %self.ctx.id(), error = %e, "Monitor tick refused");
                    self.ctx.on_fatal(&e);
                }
                Err(e) => warn!(wallet = %self.ctx.id(), error = %e, "Monitor tick failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(wallet = %self.ctx.id(), "TP/SL monitor stopped");
    }
}
