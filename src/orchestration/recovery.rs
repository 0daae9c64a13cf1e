//! Startup recovery: rebuild a wallet from the store, then ask the venue.
//!
//! No automated loop resumes until every unconfirmed order is resolved and
//! the wallet has been reconciled against venue positions.

use crate::domain::{Order, PositionId, PositionState, StrategyRecord, TpSlRule};
use crate::engine::{Mismatch, WalletContext};
use crate::error::EngineError;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub positions_restored: usize,
    pub unconfirmed_orders: usize,
    pub mismatches: Vec<Mismatch>,
    /// Strategy records that were running before the restart, relinked to
    /// their in-flight positions.
    pub resume: Vec<StrategyRecord>,
}

pub async fn recover_wallet(ctx: &WalletContext) -> Result<RecoveryReport, EngineError> {
    let state = ctx.store().load_state(ctx.id()).await?;
    let mut report = RecoveryReport::default();

    let mut orders: HashMap<PositionId, Vec<Order>> = HashMap::new();
    for order in state.orders {
        if order.is_live() && order.venue_order_id.is_none() {
            report.unconfirmed_orders += 1;
        }
        match order.position_id {
            Some(position_id) => orders.entry(position_id).or_default().push(order),
            None => warn!(wallet = %ctx.id(), order_id = %order.id, "Order without position ignored"),
        }
    }
    let mut rules: HashMap<PositionId, Vec<TpSlRule>> = HashMap::new();
    for rule in state.rules {
        rules.entry(rule.position_id).or_default().push(rule);
    }

    for position in state.positions {
        let id = position.id;
        ctx.prices().watch(position.product_id);
        let machine = ctx.restore_machine(
            position,
            orders.remove(&id).unwrap_or_default(),
            rules.remove(&id).unwrap_or_default(),
        );
        report.positions_restored += 1;
        machine.resolve_unconfirmed().await?;
    }

    let services = ctx.services();
    let venue_positions = services
        .call("get_positions", || services.venue.get_positions(&services.account))
        .await?;
    report.mismatches = ctx.reconcile(&venue_positions).await?;

    for mut record in state.strategies.into_iter().filter(|r| r.running) {
        let linked = record
            .current_position_id
            .and_then(|id| ctx.machine(id))
            .is_some_and(|m| m.state() != PositionState::Closed);
        if !linked {
            record.current_position_id = ctx.owned_position(record.strategy_type);
        }
        report.resume.push(record);
    }
    ctx.prune_closed();

    info!(
        wallet = %ctx.id(),
        positions = report.positions_restored,
        unconfirmed = report.unconfirmed_orders,
        mismatches = report.mismatches.len(),
        resume = report.resume.len(),
        "Wallet recovered"
    );
    Ok(report)
}
