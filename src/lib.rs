pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod feed;
pub mod notify;
pub mod orchestration;
pub mod predictor;
pub mod strategy;
pub mod venue;

pub use config::Config;
pub use db::{init_db, MemoryStateStore, SqliteStateStore, StateStore};
pub use domain::{
    Decimal, Order, OrderKind, OrderStatus, Position, PositionId, PositionState, ProductId, Side,
    StrategyConfig, StrategyType, TimeMs, TpSlKind, TpSlSpec, WalletId,
};
pub use engine::{PositionStateMachine, TpSlMonitor, WalletAccount, WalletContext};
pub use error::EngineError;
pub use orchestration::{recover_wallet, StrategyOrchestrator};
pub use venue::{MockVenue, RestVenueGateway, VenueError, VenueGateway};
