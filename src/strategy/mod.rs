//! Autonomous strategies driven by the orchestrator's per-instance loop.
//!
//! Every strategy follows the same discipline: at most one position at a
//! time, tracked through `StrategyRecord::current_position_id`, and a new
//! entry only once the previous position is closed.

pub mod grid;
pub mod ml;

pub use grid::GridStrategy;
pub use ml::MlSignalStrategy;

use crate::domain::{
    PositionId, PositionState, ProductId, StrategyConfig, StrategyRecord, StrategyType, TpSlSpec,
};
use crate::engine::{PositionStateMachine, WalletContext};
use crate::error::EngineError;
use crate::predictor::Predictor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of one strategy tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do this tick.
    Idle,
    /// No fresh price; the tick was skipped.
    Stale,
    /// Still managing the current position.
    Holding(PositionId),
    Opened(PositionId),
    /// Stop this instance.
    Halt(String),
}

#[async_trait]
pub trait Strategy: Send + Sync + std::fmt::Debug {
    fn strategy_type(&self) -> StrategyType;

    fn product_id(&self) -> ProductId;

    fn poll_interval(&self) -> Duration;

    /// Run one iteration. May update `record.current_position_id`; the
    /// caller persists the record when it changes.
    async fn tick(
        &mut self,
        ctx: &WalletContext,
        record: &mut StrategyRecord,
        cancel: &CancellationToken,
    ) -> Result<TickOutcome, EngineError>;
}

/// Instantiate the strategy a config describes.
pub fn build_strategy(
    config: &StrategyConfig,
    predictor: Arc<dyn Predictor>,
) -> Result<Box<dyn Strategy>, EngineError> {
    Ok(match config {
        StrategyConfig::Grid(grid) => Box::new(GridStrategy::new(grid.clone())?),
        StrategyConfig::Ml(ml) => Box::new(MlSignalStrategy::new(ml.clone(), predictor)?),
    })
}

/// Where the instance stands with its current position.
pub(crate) enum Follow {
    /// No position; free to enter.
    Free,
    Busy(Arc<PositionStateMachine>),
    Halt(String),
}

/// Resolve `current_position_id`, clearing it once the position is closed.
pub(crate) fn follow_position(ctx: &WalletContext, record: &mut StrategyRecord) -> Follow {
    let Some(id) = record.current_position_id else {
        return Follow::Free;
    };
    match ctx.machine(id) {
        None => {
            record.current_position_id = None;
            Follow::Free
        }
        Some(machine) => match machine.state() {
            PositionState::Closed => {
                record.current_position_id = None;
                Follow::Free
            }
            PositionState::Errored => Follow::Halt(format!(
                "position {} errored: {}",
                id,
                machine.position().error.unwrap_or_default()
            )),
            _ => Follow::Busy(machine),
        },
    }
}

/// Push a position forward and make sure its exits are attached.
///
/// Covers a crash or transient failure between the entry fill and the
/// TP/SL attachment.
pub(crate) async fn manage_position(
    machine: &PositionStateMachine,
    specs: &[TpSlSpec],
    cancel: &CancellationToken,
) -> Result<TickOutcome, EngineError> {
    if machine.state() == PositionState::PendingEntry {
        machine.refresh().await?;
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Holding(machine.id()));
        }
    }
    match machine.state() {
        PositionState::Open => {
            let missing: Vec<TpSlSpec> = specs
                .iter()
                .filter(|spec| machine.active_rule(spec.kind).is_none())
                .copied()
                .collect();
            if !missing.is_empty() {
                machine.attach_all(&missing).await?;
            }
        }
        PositionState::Errored => {
            return Ok(TickOutcome::Halt(format!(
                "position {} errored: {}",
                machine.id(),
                machine.position().error.unwrap_or_default()
            )))
        }
        _ => {}
    }
    Ok(TickOutcome::Holding(machine.id()))
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidRequest(message.into())
}
