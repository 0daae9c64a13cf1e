//! The loop behind one running strategy instance.

use crate::domain::{StrategyRecord, TimeMs};
use crate::db::StateDelta;
use crate::engine::WalletContext;
use crate::error::EngineError;
use crate::notify::EngineEvent;
use crate::strategy::{Strategy, TickOutcome};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs ticks until cancelled or halted. Returns the final record.
pub(crate) struct InstanceRunner {
    pub(crate) ctx: Arc<WalletContext>,
    pub(crate) strategy: Box<dyn Strategy>,
    pub(crate) record: StrategyRecord,
    pub(crate) cancel: CancellationToken,
}

impl InstanceRunner {
    pub(crate) async fn run(mut self) -> StrategyRecord {
        let wallet = self.ctx.id().clone();
        let strategy = self.record.strategy_type;
        let interval = self.strategy.poll_interval();
        info!(wallet = %wallet, strategy = %strategy, interval_ms = interval.as_millis() as u64, "Strategy started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let before = self.record.current_position_id;
            let result = self
                .strategy
                .tick(&self.ctx, &mut self.record, &self.cancel)
                .await;
            if self.record.current_position_id != before {
                if let Err(e) = self.persist().await {
                    error!(wallet = %wallet, strategy = %strategy, error = %e, "Failed to persist strategy record");
                    self.halt(e.to_string()).await;
                    return self.record;
                }
            }

            match result {
                Ok(TickOutcome::Halt(reason)) => {
                    self.halt(reason).await;
                    return self.record;
                }
                Ok(outcome) => {
                    debug!(wallet = %wallet, strategy = %strategy, ?outcome, "Tick");
                }
                Err(e) => {
                    if let Some(reason) = self.classify(&e) {
                        self.halt(reason).await;
                        return self.record;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if let Some(reason) = self.ctx.halt_reason() {
            self.halt(reason).await;
        } else {
            info!(wallet = %wallet, strategy = %strategy, "Strategy stopped");
        }
        self.record
    }

    /// Halt reason for errors that stop the instance; None to keep ticking.
    fn classify(&self, err: &EngineError) -> Option<String> {
        let wallet = self.ctx.id();
        let strategy = self.record.strategy_type;
        match err {
            EngineError::OrderRejected(_)
            | EngineError::PositionErrored(_)
            | EngineError::Store(_) => {
                error!(wallet = %wallet, strategy = %strategy, error = %err, "Strategy failed");
                Some(err.to_string())
            }
            EngineError::Fatal(_) => {
                self.ctx.on_fatal(err);
                // the wallet token fires once the limit is reached
                None
            }
            _ => {
                warn!(wallet = %wallet, strategy = %strategy, error = %err, "Tick failed, will retry");
                None
            }
        }
    }

    async fn persist(&mut self) -> Result<(), EngineError> {
        self.record.updated_at = TimeMs::now();
        let delta = StateDelta::new().strategy(&self.record);
        self.ctx.store().save_state(self.ctx.id(), delta).await?;
        Ok(())
    }

    async fn halt(&mut self, reason: String) {
        warn!(wallet = %self.ctx.id(), strategy = %self.record.strategy_type, reason = %reason, "Strategy halted");
        self.record.running = false;
        self.record.halt_reason = Some(reason.clone());
        if let Err(e) = self.persist().await {
            error!(wallet = %self.ctx.id(), strategy = %self.record.strategy_type, error = %e, "Halted record not persisted");
        }
        self.ctx.notifier().notify(EngineEvent::StrategyHalted {
            wallet_id: self.ctx.id().clone(),
            strategy: self.record.strategy_type,
            reason,
        });
    }
}
