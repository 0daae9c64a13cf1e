//! Grid: open, take profit at a fixed offset, re-enter.

use super::{follow_position, invalid, manage_position, Follow, Strategy, TickOutcome};
use crate::domain::{GridConfig, PositionState, ProductId, StrategyRecord, StrategyType, TpSlSpec};
use crate::engine::{OpenRequest, WalletContext};
use crate::error::EngineError;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct GridStrategy {
    config: GridConfig,
}

impl GridStrategy {
    pub fn new(config: GridConfig) -> Result<Self, EngineError> {
        if !config.size.is_positive() {
            return Err(invalid("grid size must be positive"));
        }
        if config.leverage == 0 {
            return Err(invalid("grid leverage must be at least 1"));
        }
        if !config.tp_offset_pct.is_positive() {
            return Err(invalid("grid take-profit offset must be positive"));
        }
        if config.sl_offset_pct.is_some_and(|sl| !sl.is_positive()) {
            return Err(invalid("grid stop-loss offset must be positive"));
        }
        if config.poll_interval_ms == 0 {
            return Err(invalid("grid poll interval must be positive"));
        }
        Ok(Self { config })
    }

    /// Fixed TP, plus the optional protective stop.
    pub fn exit_specs(&self) -> Vec<TpSlSpec> {
        let mut specs = vec![TpSlSpec::take_profit_pct(self.config.tp_offset_pct)];
        if let Some(sl) = self.config.sl_offset_pct {
            specs.push(TpSlSpec::stop_loss_pct(sl));
        }
        specs
    }
}

#[async_trait]
impl Strategy for GridStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Grid
    }

    fn product_id(&self) -> ProductId {
        self.config.product_id
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    async fn tick(
        &mut self,
        ctx: &WalletContext,
        record: &mut StrategyRecord,
        cancel: &CancellationToken,
    ) -> Result<TickOutcome, EngineError> {
        let specs = self.exit_specs();
        match follow_position(ctx, record) {
            Follow::Halt(reason) => return Ok(TickOutcome::Halt(reason)),
            Follow::Busy(machine) => return manage_position(&machine, &specs, cancel).await,
            Follow::Free => {}
        }
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Idle);
        }

        let product_id = self.config.product_id;
        ctx.prices().watch(product_id);
        if ctx.prices().fresh(product_id).is_none() {
            return Ok(TickOutcome::Stale);
        }

        let machine = ctx
            .open_position(OpenRequest {
                product_id,
                side: self.config.side,
                size: self.config.size,
                leverage: self.config.leverage,
                strategy: Some(StrategyType::Grid),
            })
            .await?;
        record.current_position_id = Some(machine.id());
        info!(
            wallet = %ctx.id(),
            strategy = "grid",
            position_id = %machine.id(),
            product = %product_id,
            "Grid entry submitted"
        );
        if machine.state() == PositionState::Open {
            machine.attach_all(&specs).await?;
        }
        Ok(TickOutcome::Opened(machine.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decimal, Side, TpSlKind};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn config() -> GridConfig {
        GridConfig {
            product_id: ProductId::new(2),
            side: Side::Long,
            size: d("0.1"),
            leverage: 5,
            tp_offset_pct: d("0.03"),
            sl_offset_pct: None,
            poll_interval_ms: 1000,
        }
    }

    #[test]
    fn test_exit_specs_with_optional_stop() {
        let grid = GridStrategy::new(config()).unwrap();
        assert_eq!(grid.exit_specs().len(), 1);

        let grid = GridStrategy::new(GridConfig {
            sl_offset_pct: Some(d("0.5")),
            ..config()
        })
        .unwrap();
        let specs = grid.exit_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].kind, TpSlKind::StopLoss);
    }

    #[test]
    fn test_invalid_configs_are_refused() {
        assert!(GridStrategy::new(GridConfig {
            size: Decimal::zero(),
            ..config()
        })
        .is_err());
        assert!(GridStrategy::new(GridConfig {
            tp_offset_pct: d("-0.03"),
            ..config()
        })
        .is_err());
        assert!(GridStrategy::new(GridConfig {
            leverage: 0,
            ..config()
        })
        .is_err());
    }
}
