//! Per-wallet isolation: identity, credentials and the position machines a
//! wallet owns. Nothing in here is shared across wallets.

use super::position_machine::{OpenRequest, PositionStateMachine};
use super::reconcile::{self, Mismatch, TrackedPosition};
use crate::config::{Config, RiskLimits, WalletConfig};
use crate::db::StateStore;
use crate::domain::{
    Decimal, Order, Position, PositionId, PositionState, ProductId, StrategyType, TpSlRule,
    WalletId,
};
use crate::error::EngineError;
use crate::feed::PriceCache;
use crate::notify::{EngineEvent, Notifier};
use crate::venue::{with_retry, RetryPolicy, VenueError, VenueGateway, VenuePosition};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Opaque API credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential(String);

impl ApiCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        ApiCredential(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiCredential(***)")
    }
}

/// Identity and credentials of one funded wallet.
#[derive(Debug, Clone)]
pub struct WalletAccount {
    pub id: WalletId,
    address: String,
    subaccount: Option<String>,
    credential: ApiCredential,
    leverage: u32,
}

impl WalletAccount {
    pub fn new(id: WalletId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            subaccount: None,
            credential: ApiCredential::new(""),
            leverage: 1,
        }
    }

    pub fn from_config(config: &WalletConfig) -> Self {
        Self {
            id: config.id.clone(),
            address: config.address.clone(),
            subaccount: config.subaccount.clone(),
            credential: config.api_key.clone(),
            leverage: config.leverage,
        }
    }

    pub fn with_subaccount(mut self, subaccount: impl Into<String>) -> Self {
        self.subaccount = Some(subaccount.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.credential = ApiCredential::new(key);
        self
    }

    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage.max(1);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn subaccount(&self) -> Option<&str> {
        self.subaccount.as_deref()
    }

    pub fn credential(&self) -> &ApiCredential {
        &self.credential
    }

    /// Leverage cap configured for this wallet.
    pub fn leverage(&self) -> u32 {
        self.leverage
    }
}

/// Engine-wide knobs every wallet shares by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub reconcile_tolerance: Decimal,
    pub risk: RiskLimits,
    /// Consecutive authentication failures before the wallet is halted.
    pub auth_failure_limit: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reconcile_tolerance: Decimal::from_str_canonical("0.00000001").unwrap_or_default(),
            risk: RiskLimits::default(),
            auth_failure_limit: 3,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry.clone(),
            reconcile_tolerance: config.reconcile_tolerance,
            risk: config.risk,
            auth_failure_limit: config.auth_failure_limit,
        }
    }
}

/// Collaborators a position machine talks to. Owned by one wallet.
#[derive(Debug)]
pub struct WalletServices {
    pub account: WalletAccount,
    pub venue: Arc<dyn VenueGateway>,
    pub store: Arc<dyn StateStore>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: EngineSettings,
    /// Consecutive authentication failures. Only a venue call made with
    /// this wallet's credentials that succeeds resets it.
    auth_failures: AtomicU32,
}

impl WalletServices {
    /// Wallet-scoped venue call under the retry policy.
    pub async fn call<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, VenueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VenueError>>,
    {
        let result = with_retry(&self.settings.retry, op_name, op).await;
        if result.is_ok() {
            self.auth_failures.store(0, Ordering::SeqCst);
        }
        result
    }

    pub fn auth_failures(&self) -> u32 {
        self.auth_failures.load(Ordering::SeqCst)
    }
}

/// Everything the engine tracks for one wallet.
///
/// Strategy runners and the TP/SL monitor of the same wallet share one
/// context; other wallets never see it.
#[derive(Debug)]
pub struct WalletContext {
    services: Arc<WalletServices>,
    prices: PriceCache,
    machines: RwLock<HashMap<PositionId, Arc<PositionStateMachine>>>,
    cancel: CancellationToken,
    halt_reason: Mutex<Option<String>>,
    /// Venue size last alerted per product, so a standing gap alerts once.
    alerted: Mutex<HashMap<ProductId, Decimal>>,
}

impl WalletContext {
    /// `parent` is the engine's root token; the wallet gets a child of it.
    pub fn new(
        account: WalletAccount,
        venue: Arc<dyn VenueGateway>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        prices: PriceCache,
        settings: EngineSettings,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            services: Arc::new(WalletServices {
                account,
                venue,
                store,
                notifier,
                settings,
                auth_failures: AtomicU32::new(0),
            }),
            prices,
            machines: RwLock::new(HashMap::new()),
            cancel: parent.child_token(),
            halt_reason: Mutex::new(None),
            alerted: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &WalletId {
        &self.services.account.id
    }

    pub fn account(&self) -> &WalletAccount {
        &self.services.account
    }

    pub fn services(&self) -> &Arc<WalletServices> {
        &self.services
    }

    pub fn venue(&self) -> &Arc<dyn VenueGateway> {
        &self.services.venue
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.services.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.services.notifier
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.services.settings
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Halted by a fatal error; an engine shutdown does not count.
    pub fn is_halted(&self) -> bool {
        self.halt_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halt_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop every task of this wallet. Other wallets keep running.
    pub fn halt_wallet(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.halt_reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        error!(wallet = %self.id(), reason = %reason, "Wallet halted");
        self.cancel.cancel();
    }

    /// Count an authentication failure. Returns true once the limit is hit.
    pub fn record_auth_failure(&self) -> bool {
        let failures = self.services.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(wallet = %self.id(), failures, "Venue refused wallet credentials");
        failures >= self.services.settings.auth_failure_limit.max(1)
    }

    /// Handle a fatal error from any wallet task, halting when the limit is hit.
    pub fn on_fatal(&self, err: &EngineError) {
        if err.is_fatal() && self.record_auth_failure() {
            self.halt_wallet(format!("authentication failure: {}", err));
        }
    }

    pub fn machine(&self, id: PositionId) -> Option<Arc<PositionStateMachine>> {
        self.machines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// All tracked machines, ordered by creation time.
    pub fn machines(&self) -> Vec<Arc<PositionStateMachine>> {
        let mut machines: Vec<_> = self
            .machines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        machines.sort_by_key(|m| (m.position().created_at, m.id()));
        machines
    }

    /// Current record of a tracked position. None once closed and pruned.
    pub fn position(&self, id: PositionId) -> Option<Position> {
        self.machine(id).map(|m| m.position())
    }

    /// Non-terminal position owned by a strategy type, if any.
    pub fn owned_position(&self, strategy: StrategyType) -> Option<PositionId> {
        self.machines()
            .into_iter()
            .map(|m| m.position())
            .find(|p| p.strategy == Some(strategy) && !p.state.is_terminal())
            .map(|p| p.id)
    }

    fn insert_machine(&self, machine: Arc<PositionStateMachine>) {
        self.machines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(machine.id(), machine);
    }

    /// Drop machines whose positions are closed. Errored ones stay visible.
    pub fn prune_closed(&self) -> usize {
        let mut machines = self.machines.write().unwrap_or_else(PoisonError::into_inner);
        let before = machines.len();
        machines.retain(|_, m| m.state() != PositionState::Closed);
        before - machines.len()
    }

    /// Rebuild a machine from persisted rows during recovery.
    pub fn restore_machine(
        &self,
        position: Position,
        orders: Vec<Order>,
        rules: Vec<TpSlRule>,
    ) -> Arc<PositionStateMachine> {
        let machine = Arc::new(PositionStateMachine::restore(
            self.services.clone(),
            position,
            orders,
            rules,
        ));
        self.insert_machine(machine.clone());
        machine
    }

    /// Validate, then open a new position on this wallet.
    ///
    /// The machine is tracked before anything is sent to the venue. When the
    /// entry cannot be confirmed yet the returned machine is still
    /// `PendingEntry` and a later `refresh` finishes the job.
    pub async fn open_position(
        &self,
        request: OpenRequest,
    ) -> Result<Arc<PositionStateMachine>, EngineError> {
        if self.is_halted() {
            return Err(EngineError::Fatal(format!("wallet {} is halted", self.id())));
        }
        self.check_pre_trade(&request).await?;

        let position = Position::pending(
            self.id().clone(),
            request.product_id,
            request.side,
            request.size,
            request.leverage,
            request.strategy,
        );
        let machine = Arc::new(PositionStateMachine::new(self.services.clone(), position));
        self.insert_machine(machine.clone());
        self.prices.watch(request.product_id);

        match machine.submit_entry().await {
            Ok(()) => Ok(machine),
            Err(e) if e.is_transient() => {
                warn!(
                    wallet = %self.id(),
                    position_id = %machine.id(),
                    error = %e,
                    "Entry not confirmed yet"
                );
                Ok(machine)
            }
            Err(e) => Err(e),
        }
    }

    /// Local limits first, then the venue-reported free margin.
    async fn check_pre_trade(&self, request: &OpenRequest) -> Result<(), EngineError> {
        let risk = &self.services.settings.risk;
        if !request.size.is_positive() {
            return Err(EngineError::InvalidRequest(format!(
                "size must be positive, got {}",
                request.size
            )));
        }
        let leverage_cap = risk.max_leverage.min(self.account().leverage());
        if request.leverage == 0 || request.leverage > leverage_cap {
            return Err(EngineError::OrderRejected(format!(
                "leverage {} exceeds limit {}",
                request.leverage, leverage_cap
            )));
        }

        let price = self.reference_price(request.product_id).await?;
        let notional = request.size * price;
        if notional < risk.min_notional {
            return Err(EngineError::OrderRejected(format!(
                "notional {} below minimum {}",
                notional, risk.min_notional
            )));
        }

        let services = &self.services;
        let balance = services
            .call("get_balance", || services.venue.get_balance(&services.account))
            .await?;
        let required_margin = notional / Decimal::from_i64(i64::from(request.leverage));
        if required_margin > balance.available {
            return Err(EngineError::OrderRejected(format!(
                "insufficient margin: need {}, available {}",
                required_margin, balance.available
            )));
        }
        Ok(())
    }

    /// Fresh cached mark, falling back to a direct venue query.
    async fn reference_price(&self, product_id: ProductId) -> Result<Decimal, EngineError> {
        if let Some(snapshot) = self.prices.fresh(product_id) {
            return Ok(snapshot.mark);
        }
        let services = &self.services;
        let snapshot = with_retry(&services.settings.retry, "get_price", || {
            services.venue.get_price(product_id)
        })
        .await?;
        self.prices.insert(snapshot);
        Ok(snapshot.mark)
    }

    /// Compare tracked positions against venue truth and act on mismatches.
    ///
    /// Positions behind a mismatch become `Errored` and an alert is emitted.
    /// When resting TP/SL orders could explain the gap they are re-polled
    /// once before the verdict.
    pub async fn reconcile(
        &self,
        venue_positions: &[VenuePosition],
    ) -> Result<Vec<Mismatch>, EngineError> {
        let tolerance = self.services.settings.reconcile_tolerance;
        let mismatches =
            reconcile::compare(&self.tracked_positions(), venue_positions, tolerance);
        if mismatches.is_empty() {
            self.alerted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            return Ok(mismatches);
        }

        let mut repolled = false;
        for mismatch in &mismatches {
            for id in &mismatch.positions {
                if let Some(machine) = self.machine(*id) {
                    if machine.has_resting_exit_orders() {
                        machine.refresh().await?;
                        repolled = true;
                    }
                }
            }
        }
        let mismatches = if repolled {
            reconcile::compare(&self.tracked_positions(), venue_positions, tolerance)
        } else {
            mismatches
        };

        self.alerted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|product, _| mismatches.iter().any(|m| m.product_id == *product));

        for mismatch in &mismatches {
            let first = self.remember_alert(mismatch);
            if mismatch.positions.is_empty() && !first {
                continue;
            }
            warn!(
                wallet = %self.id(),
                product = %mismatch.product_id,
                local = %mismatch.local_size,
                venue = %mismatch.venue_size,
                "Reconciliation mismatch"
            );
            for id in &mismatch.positions {
                if let Some(machine) = self.machine(*id) {
                    machine
                        .mark_errored(format!(
                            "reconciliation mismatch: local {} vs venue {}",
                            mismatch.local_size, mismatch.venue_size
                        ))
                        .await?;
                }
            }
            self.services
                .notifier
                .notify(EngineEvent::ReconciliationMismatch {
                    wallet_id: self.id().clone(),
                    product_id: mismatch.product_id,
                    local_size: mismatch.local_size,
                    venue_size: mismatch.venue_size,
                    positions: mismatch.positions.clone(),
                });
        }
        if !mismatches.is_empty() {
            info!(wallet = %self.id(), count = mismatches.len(), "Reconciliation finished with mismatches");
        }
        Ok(mismatches)
    }

    fn tracked_positions(&self) -> Vec<TrackedPosition> {
        self.machines()
            .iter()
            .map(|m| TrackedPosition::from_position(&m.position()))
            .collect()
    }

    /// True unless the same venue size was already alerted for the product.
    fn remember_alert(&self, mismatch: &Mismatch) -> bool {
        let mut alerts = self
            .alerted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        alerts.insert(mismatch.product_id, mismatch.venue_size) != Some(mismatch.venue_size)
    }
}
