//! Durable engine state.
//!
//! This module provides:
//! - The `StateStore` trait: per-wallet `load_state` / `save_state`
//! - `WalletState` snapshots and `StateDelta` write batches
//! - SQLite initialization, pragmas and migrations
//! - `SqliteStateStore` (one transaction per delta) and `MemoryStateStore`

pub mod memory;
pub mod migrations;
pub mod repo;

pub use memory::MemoryStateStore;
pub use migrations::init_db;
pub use repo::SqliteStateStore;

use crate::domain::{Order, Position, StrategyRecord, TpSlRule, WalletId};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        StoreError::Corrupt {
            table,
            message: message.into(),
        }
    }
}

/// Everything persisted for one wallet that is still relevant at startup.
///
/// Closed positions (and their rules) are archived and not loaded. Orders are
/// loaded when they belong to a loaded position or are still live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletState {
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub rules: Vec<TpSlRule>,
    pub strategies: Vec<StrategyRecord>,
}

/// Entities changed by one transition. Applied atomically: all rows or none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub rules: Vec<TpSlRule>,
    pub strategies: Vec<StrategyRecord>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(mut self, position: &Position) -> Self {
        self.positions.push(position.clone());
        self
    }

    pub fn order(mut self, order: &Order) -> Self {
        self.orders.push(order.clone());
        self
    }

    pub fn rule(mut self, rule: &TpSlRule) -> Self {
        self.rules.push(rule.clone());
        self
    }

    pub fn strategy(mut self, record: &StrategyRecord) -> Self {
        self.strategies.push(record.clone());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
            && self.orders.is_empty()
            && self.rules.is_empty()
            && self.strategies.is_empty()
    }
}

/// Persistence for position, order, rule and strategy state.
///
/// `save_state` must be durable before it returns; callers treat a
/// transition as complete only afterwards.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    async fn load_state(&self, wallet_id: &WalletId) -> Result<WalletState, StoreError>;

    async fn save_state(&self, wallet_id: &WalletId, delta: StateDelta) -> Result<(), StoreError>;
}
