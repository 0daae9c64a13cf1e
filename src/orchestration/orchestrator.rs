use super::recovery::{recover_wallet, RecoveryReport};
use super::runner::InstanceRunner;
use crate::db::StateDelta;
use crate::domain::{StrategyConfig, StrategyRecord, StrategyType, TimeMs, WalletId};
use crate::engine::{TpSlMonitor, WalletContext};
use crate::error::EngineError;
use crate::predictor::Predictor;
use crate::strategy::build_strategy;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type InstanceKey = (WalletId, StrategyType);

#[derive(Debug)]
struct Instance {
    cancel: CancellationToken,
    handle: JoinHandle<StrategyRecord>,
}

/// Starts, stops and supervises strategy instances across wallets.
///
/// One task per (wallet, strategy type) plus one TP/SL monitor per wallet.
/// A failing instance halts alone; a fatal wallet error stops that wallet's
/// tasks and nothing else.
#[derive(Debug)]
pub struct StrategyOrchestrator {
    wallets: HashMap<WalletId, Arc<WalletContext>>,
    predictor: Arc<dyn Predictor>,
    instances: Mutex<HashMap<InstanceKey, Instance>>,
    monitors: StdMutex<Vec<JoinHandle<()>>>,
    root: CancellationToken,
}

impl StrategyOrchestrator {
    /// `root` must be the token the wallet contexts were created under.
    pub fn new(
        wallets: Vec<Arc<WalletContext>>,
        predictor: Arc<dyn Predictor>,
        root: CancellationToken,
    ) -> Self {
        Self {
            wallets: wallets
                .into_iter()
                .map(|ctx| (ctx.id().clone(), ctx))
                .collect(),
            predictor,
            instances: Mutex::new(HashMap::new()),
            monitors: StdMutex::new(Vec::new()),
            root,
        }
    }

    pub fn wallet(&self, wallet_id: &WalletId) -> Result<&Arc<WalletContext>, EngineError> {
        self.wallets
            .get(wallet_id)
            .ok_or_else(|| EngineError::UnknownWallet(wallet_id.clone()))
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Arc<WalletContext>> {
        self.wallets.values()
    }

    /// Start a strategy instance on a wallet.
    pub async fn start(
        &self,
        wallet_id: &WalletId,
        config: StrategyConfig,
    ) -> Result<(), EngineError> {
        let ctx = self.wallet(wallet_id)?;
        let mut record = StrategyRecord::new(wallet_id.clone(), config);
        record.current_position_id = ctx.owned_position(record.strategy_type);
        self.launch(ctx.clone(), record).await
    }

    /// Restart records that were running before a restart.
    pub async fn resume(&self, records: Vec<StrategyRecord>) -> Vec<(StrategyRecord, EngineError)> {
        let mut failed = Vec::new();
        for record in records {
            let ctx = match self.wallet(&record.wallet_id) {
                Ok(ctx) => ctx.clone(),
                Err(e) => {
                    failed.push((record, e));
                    continue;
                }
            };
            if let Err(e) = self.launch(ctx, record.clone()).await {
                warn!(wallet = %record.wallet_id, strategy = %record.strategy_type, error = %e, "Resume failed");
                failed.push((record, e));
            }
        }
        failed
    }

    async fn launch(
        &self,
        ctx: Arc<WalletContext>,
        mut record: StrategyRecord,
    ) -> Result<(), EngineError> {
        if ctx.is_halted() {
            return Err(EngineError::Fatal(format!(
                "wallet {} is halted: {}",
                ctx.id(),
                ctx.halt_reason().unwrap_or_default()
            )));
        }
        let key = (ctx.id().clone(), record.strategy_type);
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&key) {
            if !existing.handle.is_finished() {
                return Err(EngineError::AlreadyRunning {
                    wallet_id: key.0,
                    strategy: key.1,
                });
            }
            instances.remove(&key);
        }

        let strategy = build_strategy(&record.config, self.predictor.clone())?;
        ctx.prices().watch(strategy.product_id());
        record.running = true;
        record.halt_reason = None;
        record.updated_at = TimeMs::now();
        ctx.store()
            .save_state(ctx.id(), StateDelta::new().strategy(&record))
            .await?;

        let cancel = ctx.cancel_token().child_token();
        let runner = InstanceRunner {
            ctx: ctx.clone(),
            strategy,
            record,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(runner.run());
        info!(wallet = %key.0, strategy = %key.1, "Strategy instance launched");
        instances.insert(key, Instance { cancel, handle });
        Ok(())
    }

    /// Stop an instance cooperatively.
    ///
    /// Returns after the loop has exited and any operation in flight on the
    /// instance's position has finished and been persisted.
    pub async fn stop(
        &self,
        wallet_id: &WalletId,
        strategy: StrategyType,
    ) -> Result<StrategyRecord, EngineError> {
        let ctx = self.wallet(wallet_id)?.clone();
        let key = (wallet_id.clone(), strategy);
        let instance = self
            .instances
            .lock()
            .await
            .remove(&key)
            .ok_or_else(|| EngineError::NotRunning {
                wallet_id: wallet_id.clone(),
                strategy,
            })?;

        instance.cancel.cancel();
        let mut record = instance
            .handle
            .await
            .map_err(|e| EngineError::Fatal(format!("strategy task failed: {}", e)))?;

        if let Some(machine) = record.current_position_id.and_then(|id| ctx.machine(id)) {
            machine.wait_idle().await;
        }
        record.running = false;
        record.updated_at = TimeMs::now();
        ctx.store()
            .save_state(ctx.id(), StateDelta::new().strategy(&record))
            .await?;
        info!(wallet = %wallet_id, strategy = %strategy, "Strategy instance stopped");
        Ok(record)
    }

    /// Instances whose loops are still alive, sorted.
    pub async fn running(&self) -> Vec<(WalletId, StrategyType)> {
        let mut keys: Vec<InstanceKey> = self
            .instances
            .lock()
            .await
            .iter()
            .filter(|(_, instance)| !instance.handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Recover every wallet before any loop starts.
    pub async fn recover(&self) -> Vec<(WalletId, Result<RecoveryReport, EngineError>)> {
        let mut reports = Vec::new();
        let mut ids: Vec<&WalletId> = self.wallets.keys().collect();
        ids.sort();
        for id in ids {
            let ctx = &self.wallets[id];
            let result = recover_wallet(ctx).await;
            if let Err(e) = &result {
                error!(wallet = %id, error = %e, "Recovery failed");
                ctx.on_fatal(e);
            }
            reports.push((id.clone(), result));
        }
        reports
    }

    /// One TP/SL monitor per wallet, stopped with the wallet.
    pub fn spawn_monitors(&self, interval: Duration) {
        let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        for ctx in self.wallets.values() {
            let monitor = TpSlMonitor::new(ctx.clone(), interval);
            monitors.push(tokio::spawn(monitor.run(ctx.cancel_token().clone())));
        }
    }

    /// Cancel everything and wait for every task to finish its current step.
    ///
    /// Records keep `running = true` so the next start resumes them.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.root.cancel();

        let instances: Vec<(InstanceKey, Instance)> =
            self.instances.lock().await.drain().collect();
        let results = join_all(instances.into_iter().map(|(key, instance)| async move {
            (key, instance.handle.await)
        }))
        .await;
        for ((wallet, strategy), result) in results {
            if let Err(e) = result {
                error!(wallet = %wallet, strategy = %strategy, error = %e, "Strategy task failed");
            }
        }

        let monitors: Vec<JoinHandle<()>> = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        join_all(monitors).await;

        for ctx in self.wallets.values() {
            join_all(ctx.machines().iter().map(|m| m.wait_idle())).await;
        }
        info!("Orchestrator stopped");
    }
}
