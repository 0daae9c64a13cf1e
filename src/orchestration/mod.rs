//! Strategy supervision and startup recovery.

pub mod orchestrator;
pub mod recovery;
mod runner;

pub use orchestrator::StrategyOrchestrator;
pub use recovery::{recover_wallet, RecoveryReport};
