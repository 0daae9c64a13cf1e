//! SQLite implementation of the state store.
//!
//! Rows are organized across submodules by entity:
//! - `positions.rs` - position rows
//! - `orders.rs` - order rows
//! - `strategies.rs` - TP/SL rules and strategy instances
//!
//! Every `save_state` call is one transaction of upserts, so a crash leaves
//! either the whole transition or none of it on disk.

mod orders;
mod positions;
mod strategies;

use super::{StateDelta, StateStore, StoreError, WalletState};
use crate::domain::{Decimal, OrderId, PositionId, WalletId};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use tracing::debug;
use uuid::Uuid;

/// Durable store backed by a SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteStateStore { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_state(&self, wallet_id: &WalletId) -> Result<WalletState, StoreError> {
        let positions = positions::load_active(&self.pool, wallet_id).await?;
        let orders = orders::load_relevant(&self.pool, wallet_id).await?;
        let rules = strategies::load_rules(&self.pool, wallet_id).await?;
        let strategies = strategies::load_strategies(&self.pool, wallet_id).await?;
        debug!(
            wallet = %wallet_id,
            positions = positions.len(),
            orders = orders.len(),
            rules = rules.len(),
            strategies = strategies.len(),
            "Loaded wallet state"
        );
        Ok(WalletState {
            positions,
            orders,
            rules,
            strategies,
        })
    }

    async fn save_state(&self, wallet_id: &WalletId, delta: StateDelta) -> Result<(), StoreError> {
        if delta.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for position in &delta.positions {
            positions::upsert(&mut tx, position).await?;
        }
        for order in &delta.orders {
            orders::upsert(&mut tx, order).await?;
        }
        for rule in &delta.rules {
            strategies::upsert_rule(&mut tx, wallet_id, rule).await?;
        }
        for record in &delta.strategies {
            strategies::upsert_strategy(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn parse_decimal(table: &'static str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str_canonical(raw)
        .map_err(|e| StoreError::corrupt(table, format!("invalid decimal {}: {}", raw, e)))
}

fn parse_optional_decimal(
    table: &'static str,
    raw: Option<String>,
) -> Result<Option<Decimal>, StoreError> {
    raw.map(|s| parse_decimal(table, &s)).transpose()
}

fn parse_uuid(table: &'static str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::corrupt(table, format!("invalid id {}: {}", raw, e)))
}

fn parse_position_id(table: &'static str, raw: &str) -> Result<PositionId, StoreError> {
    parse_uuid(table, raw).map(PositionId)
}

fn parse_order_id(table: &'static str, raw: &str) -> Result<OrderId, StoreError> {
    parse_uuid(table, raw).map(OrderId)
}
