use crate::db::StoreError;
use crate::domain::{PositionId, PositionState, StrategyType, WalletId};
use crate::venue::VenueError;
use thiserror::Error;

/// Engine error taxonomy.
///
/// `Transient` leaves state unchanged and is retried on the next tick.
/// `OrderRejected` and `PositionErrored` halt the owning strategy. A
/// reconciliation mismatch surfaces as an errored position.
/// `Fatal` stops every strategy of the wallet.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transient venue failure: {0}")]
    Transient(VenueError),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Fatal wallet error: {0}")]
    Fatal(String),

    #[error("Strategy {strategy} already running for wallet {wallet_id}")]
    AlreadyRunning {
        wallet_id: WalletId,
        strategy: StrategyType,
    },

    #[error("Strategy {strategy} is not running for wallet {wallet_id}")]
    NotRunning {
        wallet_id: WalletId,
        strategy: StrategyType,
    },

    #[error("Unknown wallet: {0}")]
    UnknownWallet(WalletId),

    #[error("Position {position_id} is {state}, expected {expected}")]
    InvalidState {
        position_id: PositionId,
        state: PositionState,
        expected: &'static str,
    },

    #[error("Position {0} is errored")]
    PositionErrored(PositionId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

impl From<VenueError> for EngineError {
    fn from(err: VenueError) -> Self {
        match err {
            VenueError::Rejected(reason) => EngineError::OrderRejected(reason),
            VenueError::Unauthorized(reason) => EngineError::Fatal(reason),
            other => EngineError::Transient(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_error_classification() {
        assert!(matches!(
            EngineError::from(VenueError::Rejected("margin".into())),
            EngineError::OrderRejected(_)
        ));
        assert!(EngineError::from(VenueError::Unauthorized("key".into())).is_fatal());
        assert!(EngineError::from(VenueError::Timeout(5000)).is_transient());
        assert!(EngineError::from(VenueError::RateLimited).is_transient());
    }

    #[test]
    fn test_display() {
        let err = EngineError::AlreadyRunning {
            wallet_id: WalletId::new("main"),
            strategy: StrategyType::Grid,
        };
        assert_eq!(
            err.to_string(),
            "Strategy grid already running for wallet main"
        );
    }
}
