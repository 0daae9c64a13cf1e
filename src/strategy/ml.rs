//! ML signal: enter on a confident prediction, exit per risk scenario.

use super::{follow_position, invalid, manage_position, Follow, Strategy, TickOutcome};
use crate::domain::{
    Decimal, MlConfig, PositionState, ProductId, StrategyRecord, StrategyType, TimeMs, TpSlSpec,
};
use crate::engine::{OpenRequest, WalletContext};
use crate::error::EngineError;
use crate::predictor::{Prediction, Predictor};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
pub struct MlSignalStrategy {
    config: MlConfig,
    predictor: Arc<dyn Predictor>,
    /// Rolling mark prices, oldest first.
    history: VecDeque<Decimal>,
    last_observed: Option<TimeMs>,
}

impl MlSignalStrategy {
    pub fn new(config: MlConfig, predictor: Arc<dyn Predictor>) -> Result<Self, EngineError> {
        if !config.size.is_positive() {
            return Err(invalid("ml size must be positive"));
        }
        if config.leverage == 0 {
            return Err(invalid("ml leverage must be at least 1"));
        }
        if config.min_confidence.is_negative() || config.min_confidence > Decimal::one() {
            return Err(invalid("ml min_confidence must be within [0, 1]"));
        }
        if config.history_window == 0 {
            return Err(invalid("ml history window must be positive"));
        }
        if config.poll_interval_ms == 0 {
            return Err(invalid("ml poll interval must be positive"));
        }
        Ok(Self {
            history: VecDeque::with_capacity(config.history_window),
            config,
            predictor,
            last_observed: None,
        })
    }

    /// Seed the window, e.g. from candles fetched at startup.
    pub fn with_history(mut self, prices: impl IntoIterator<Item = Decimal>) -> Self {
        for price in prices {
            self.push_price(price);
        }
        self
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn push_price(&mut self, price: Decimal) {
        self.history.push_back(price);
        while self.history.len() > self.config.history_window {
            self.history.pop_front();
        }
    }

    fn observe(&mut self, ctx: &WalletContext) {
        if let Some(snapshot) = ctx.prices().fresh(self.config.product_id) {
            if self.last_observed != Some(snapshot.observed_at) {
                self.last_observed = Some(snapshot.observed_at);
                self.push_price(snapshot.mark);
            }
        }
    }

    fn exit_specs(&self) -> Vec<TpSlSpec> {
        self.config.scenario.specs().to_vec()
    }

    /// A failed or slow predictor means no signal.
    async fn predict(&self) -> Option<Prediction> {
        let history: Vec<Decimal> = self.history.iter().copied().collect();
        let deadline = Duration::from_millis(self.config.predictor_timeout_ms);
        match tokio::time::timeout(deadline, self.predictor.predict(&history)).await {
            Ok(Ok(prediction)) => Some(prediction),
            Ok(Err(e)) => {
                debug!(product = %self.config.product_id, error = %e, "No signal");
                None
            }
            Err(_) => {
                debug!(
                    product = %self.config.product_id,
                    timeout_ms = self.config.predictor_timeout_ms,
                    "Predictor timed out"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Strategy for MlSignalStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Ml
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
        ctx.prices().watch(self.config.product_id);
        self.observe(ctx);

        let specs = self.exit_specs();
        match follow_position(ctx, record) {
            Follow::Halt(reason) => return Ok(TickOutcome::Halt(reason)),
            // an open position is never overridden by a newer prediction
            Follow::Busy(machine) => return manage_position(&machine, &specs, cancel).await,
            Follow::Free => {}
        }
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Idle);
        }

        let Some(prediction) = self.predict().await else {
            return Ok(TickOutcome::Idle);
        };
        let Some(side) = prediction.direction.side() else {
            return Ok(TickOutcome::Idle);
        };
        if prediction.confidence < self.config.min_confidence {
            debug!(
                confidence = %prediction.confidence,
                threshold = %self.config.min_confidence,
                "Signal below threshold"
            );
            return Ok(TickOutcome::Idle);
        }
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Idle);
        }
        if ctx.prices().fresh(self.config.product_id).is_none() {
            return Ok(TickOutcome::Stale);
        }

        let machine = ctx
            .open_position(OpenRequest {
                product_id: self.config.product_id,
                side,
                size: self.config.size,
                leverage: self.config.leverage,
                strategy: Some(StrategyType::Ml),
            })
            .await?;
        record.current_position_id = Some(machine.id());
        info!(
            wallet = %ctx.id(),
            strategy = "ml",
            position_id = %machine.id(),
            side = %side,
            confidence = %prediction.confidence,
            "Signal entry submitted"
        );
        if machine.state() == PositionState::Open {
            machine.attach_all(&specs).await?;
        }
        Ok(TickOutcome::Opened(machine.id()))
    }
}
