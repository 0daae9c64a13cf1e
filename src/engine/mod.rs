//! Position execution engine.
//!
//! This module provides:
//! - `WalletContext` / `WalletAccount`: per-wallet isolation of credentials and state
//! - `PositionStateMachine`: entry, TP/SL attachment, exits and fill tracking
//! - `reconcile`: deterministic comparison against venue-reported positions
//! - `TpSlMonitor`: the per-wallet trigger and reconciliation loop

pub mod position_machine;
pub mod reconcile;
pub mod tpsl_monitor;
pub mod wallet;

pub use position_machine::{OpenRequest, PositionStateMachine};
pub use reconcile::{compare, Mismatch, TrackedPosition};
pub use tpsl_monitor::{MonitorReport, TpSlMonitor};
pub use wallet::{ApiCredential, EngineSettings, WalletAccount, WalletContext, WalletServices};
