//! In-memory state store for tests and dry runs.

use super::{StateDelta, StateStore, StoreError, WalletState};
use crate::domain::{
    Order, Position, PositionId, PositionState, StrategyRecord, StrategyType, TpSlKind, TpSlRule,
    WalletId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default, Clone)]
struct WalletTables {
    positions: BTreeMap<PositionId, Position>,
    orders: HashMap<String, Order>,
    rules: BTreeMap<(PositionId, &'static str), TpSlRule>,
    strategies: BTreeMap<StrategyType, StrategyRecord>,
}

/// State store that keeps everything in process memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    wallets: Arc<Mutex<HashMap<WalletId, WalletTables>>>,
    saves: Arc<Mutex<usize>>,
    fail_strategy_writes: Arc<AtomicBool>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn wallets(&self) -> MutexGuard<'_, HashMap<WalletId, WalletTables>> {
        self.wallets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A position by id, including archived (closed) ones.
    pub fn position(&self, wallet_id: &WalletId, id: PositionId) -> Option<Position> {
        self.wallets()
            .get(wallet_id)
            .and_then(|t| t.positions.get(&id).cloned())
    }

    /// Every persisted order of a wallet, including terminal ones.
    pub fn orders(&self, wallet_id: &WalletId) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .wallets()
            .get(wallet_id)
            .map(|t| t.orders.values().cloned().collect())
            .unwrap_or_default();
        orders.sort_by_key(|o| (o.submitted_at, o.id));
        orders
    }

    pub fn rule(&self, wallet_id: &WalletId, id: PositionId, kind: TpSlKind) -> Option<TpSlRule> {
        self.wallets()
            .get(wallet_id)
            .and_then(|t| t.rules.get(&(id, kind.as_str())).cloned())
    }

    pub fn strategy(&self, wallet_id: &WalletId, kind: StrategyType) -> Option<StrategyRecord> {
        self.wallets()
            .get(wallet_id)
            .and_then(|t| t.strategies.get(&kind).cloned())
    }

    /// Refuse every delta that carries a strategy record, as a database
    /// that went away would.
    pub fn fail_strategy_writes(&self, fail: bool) {
        self.fail_strategy_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of non-empty deltas applied so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_state(&self, wallet_id: &WalletId) -> Result<WalletState, StoreError> {
        let wallets = self.wallets();
        let Some(tables) = wallets.get(wallet_id) else {
            return Ok(WalletState::default());
        };

        let mut positions: Vec<Position> = tables
            .positions
            .values()
            .filter(|p| p.state != PositionState::Closed)
            .cloned()
            .collect();
        positions.sort_by_key(|p| (p.created_at, p.id));

        let loaded = |id: &Option<PositionId>| {
            id.map(|id| positions.iter().any(|p| p.id == id))
                .unwrap_or(false)
        };
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.is_live() || loaded(&o.position_id))
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.submitted_at, o.id));

        let rules = tables
            .rules
            .values()
            .filter(|r| loaded(&Some(r.position_id)))
            .cloned()
            .collect();

        Ok(WalletState {
            positions,
            orders,
            rules,
            strategies: tables.strategies.values().cloned().collect(),
        })
    }

    async fn save_state(&self, wallet_id: &WalletId, delta: StateDelta) -> Result<(), StoreError> {
        if delta.is_empty() {
            return Ok(());
        }
        if !delta.strategies.is_empty() && self.fail_strategy_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        let mut wallets = self.wallets();
        let tables = wallets.entry(wallet_id.clone()).or_default();
        for position in delta.positions {
            tables.positions.insert(position.id, position);
        }
        for order in delta.orders {
            tables.orders.insert(order.client_id.clone(), order);
        }
        for rule in delta.rules {
            tables
                .rules
                .insert((rule.position_id, rule.kind.as_str()), rule);
        }
        for record in delta.strategies {
            tables.strategies.insert(record.strategy_type, record);
        }
        drop(wallets);
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decimal, ProductId, Side};

    #[tokio::test]
    async fn test_closed_positions_are_not_loaded_but_kept() {
        let store = MemoryStateStore::new();
        let wallet = WalletId::new("main");
        let mut position = Position::pending(
            wallet.clone(),
            ProductId::new(2),
            Side::Long,
            Decimal::one(),
            1,
            None,
        );
        position.state = PositionState::Closed;
        store
            .save_state(&wallet, StateDelta::new().position(&position))
            .await
            .unwrap();

        assert!(store.load_state(&wallet).await.unwrap().positions.is_empty());
        assert!(store.position(&wallet, position.id).is_some());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_delta_is_noop() {
        let store = MemoryStateStore::new();
        store
            .save_state(&WalletId::new("main"), StateDelta::new())
            .await
            .unwrap();
        assert_eq!(store.save_count(), 0);
    }
}
