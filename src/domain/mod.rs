//! Domain types for the position and strategy execution engine.
//!
//! This module provides:
//! - Exact numeric handling via the Decimal wrapper
//! - Primitives: TimeMs, WalletId, ProductId, Side
//! - Position, Order and TP/SL rule records with their lifecycle enums
//! - Strategy configuration and persisted instance records

pub mod decimal;
pub mod order;
pub mod position;
pub mod price;
pub mod primitives;
pub mod strategy;
pub mod tpsl;

pub use decimal::Decimal;
pub use order::{Order, OrderId, OrderKind, OrderStatus};
pub use position::{Position, PositionId, PositionState};
pub use price::PriceSnapshot;
pub use primitives::{ProductId, Side, TimeMs, WalletId};
pub use strategy::{GridConfig, MlConfig, StrategyConfig, StrategyRecord, StrategyType};
pub use tpsl::{RiskScenario, ScenarioProjection, TpSlKind, TpSlMode, TpSlRule, TpSlSpec};
