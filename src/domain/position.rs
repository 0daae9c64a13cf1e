//! Position record and its lifecycle states.

use crate::domain::{Decimal, ProductId, Side, StrategyType, TimeMs, WalletId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionId(pub Uuid);

impl PositionId {
    pub fn new() -> Self {
        PositionId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<PositionId> {
        Uuid::parse_str(s).ok().map(PositionId)
    }
}

impl Default for PositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PositionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `PendingEntry -> Open -> PendingExit -> Closed`, with `Errored` absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    PendingEntry,
    Open,
    PendingExit,
    Closed,
    Errored,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::PendingEntry => "pending_entry",
            PositionState::Open => "open",
            PositionState::PendingExit => "pending_exit",
            PositionState::Closed => "closed",
            PositionState::Errored => "errored",
        }
    }

    pub fn parse(s: &str) -> Option<PositionState> {
        match s {
            "pending_entry" => Some(PositionState::PendingEntry),
            "open" => Some(PositionState::Open),
            "pending_exit" => Some(PositionState::PendingExit),
            "closed" => Some(PositionState::Closed),
            "errored" => Some(PositionState::Errored),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed | PositionState::Errored)
    }

    /// Whether the venue should currently hold exposure for this position.
    pub fn holds_exposure(&self) -> bool {
        matches!(self, PositionState::Open | PositionState::PendingExit)
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub wallet_id: WalletId,
    pub product_id: ProductId,
    pub side: Side,
    pub requested_size: Decimal,
    /// Remaining size still held on the venue (unsigned).
    pub size: Decimal,
    /// Venue-reported average fill price; unknown until the entry fills.
    pub entry_price: Option<Decimal>,
    pub leverage: u32,
    /// Strategy that owns this position; None for manually opened positions.
    pub strategy: Option<StrategyType>,
    pub state: PositionState,
    pub created_at: TimeMs,
    pub opened_at: Option<TimeMs>,
    pub closed_at: Option<TimeMs>,
    pub exit_price: Option<Decimal>,
    pub error: Option<String>,
}

impl Position {
    pub fn pending(
        wallet_id: WalletId,
        product_id: ProductId,
        side: Side,
        size: Decimal,
        leverage: u32,
        strategy: Option<StrategyType>,
    ) -> Self {
        Self {
            id: PositionId::new(),
            wallet_id,
            product_id,
            side,
            requested_size: size,
            size: Decimal::zero(),
            entry_price: None,
            leverage,
            strategy,
            state: PositionState::PendingEntry,
            created_at: TimeMs::now(),
            opened_at: None,
            closed_at: None,
            exit_price: None,
            error: None,
        }
    }

    /// Size signed by side: positive long, negative short.
    pub fn signed_size(&self) -> Decimal {
        match self.side {
            Side::Long => self.size,
            Side::Short => -self.size,
        }
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.size * price
    }
}
