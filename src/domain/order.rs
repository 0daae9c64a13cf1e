//! Orders: the unit of idempotency for every venue action.

use crate::domain::{Decimal, PositionId, ProductId, Side, TimeMs, WalletId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        OrderId(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an order does for its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Entry,
    TakeProfit,
    StopLoss,
    Close,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Entry => "entry",
            OrderKind::TakeProfit => "take_profit",
            OrderKind::StopLoss => "stop_loss",
            OrderKind::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<OrderKind> {
        match s {
            "entry" => Some(OrderKind::Entry),
            "take_profit" => Some(OrderKind::TakeProfit),
            "stop_loss" => Some(OrderKind::StopLoss),
            "close" => Some(OrderKind::Close),
            _ => None,
        }
    }

    /// Exit orders only ever reduce the position.
    pub fn is_reduce_only(&self) -> bool {
        !matches!(self, OrderKind::Entry)
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Recorded locally; submission not yet confirmed by the venue.
    Pending,
    /// Venue acknowledged the order; it may be partially filled.
    Acked,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Acked => "acked",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "acked" => Some(OrderStatus::Acked),
            "filled" => Some(OrderStatus::Filled),
            "rejected" => Some(OrderStatus::Rejected),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Acked)
    }
}

/// A single order tracked by a position state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Deterministic idempotency key sent to the venue; reused across retries.
    pub client_id: String,
    /// Venue-assigned id, known once acknowledged.
    pub venue_order_id: Option<String>,
    pub position_id: Option<PositionId>,
    pub wallet_id: WalletId,
    pub product_id: ProductId,
    pub kind: OrderKind,
    /// Direction of the trade (exit orders trade opposite to the position).
    pub side: Side,
    /// None for market orders.
    pub requested_price: Option<Decimal>,
    pub requested_size: Decimal,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submitted_at: TimeMs,
    pub updated_at: TimeMs,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wallet_id: WalletId,
        position_id: Option<PositionId>,
        product_id: ProductId,
        kind: OrderKind,
        side: Side,
        requested_price: Option<Decimal>,
        requested_size: Decimal,
        attempt: u32,
    ) -> Self {
        let now = TimeMs::now();
        let client_id = Self::compute_client_id(&wallet_id, position_id.as_ref(), kind, attempt);
        Self {
            id: OrderId::new(),
            client_id,
            venue_order_id: None,
            position_id,
            wallet_id,
            product_id,
            kind,
            side,
            requested_price,
            requested_size,
            filled_size: Decimal::zero(),
            avg_fill_price: None,
            status: OrderStatus::Pending,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Derive a stable client order id from (wallet, position, kind, attempt).
    ///
    /// The same logical action always hashes to the same id, so a retried
    /// submission is recognisable by the venue as a duplicate.
    pub fn compute_client_id(
        wallet_id: &WalletId,
        position_id: Option<&PositionId>,
        kind: OrderKind,
        attempt: u32,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(wallet_id.as_str().as_bytes());
        hasher.update(b"|");
        if let Some(position_id) = position_id {
            hasher.update(position_id.0.as_bytes());
        }
        hasher.update(b"|");
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(attempt.to_be_bytes());
        let digest = hasher.finalize();
        format!("pk-{}", &hex::encode(digest)[..32])
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn remaining_size(&self) -> Decimal {
        (self.requested_size - self.filled_size).max(Decimal::zero())
    }

    pub fn touch(&mut self) {
        self.updated_at = TimeMs::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_client_id_is_deterministic() {
        let wallet = WalletId::new("main");
        let position = PositionId::new();
        let a = Order::compute_client_id(&wallet, Some(&position), OrderKind::Entry, 0);
        let b = Order::compute_client_id(&wallet, Some(&position), OrderKind::Entry, 0);
        assert_eq!(a, b);
        assert!(a.starts_with("pk-"));
        assert_eq!(a.len(), 35);
    }

    #[test]
    fn test_client_id_differs_by_kind_and_attempt() {
        let wallet = WalletId::new("main");
        let position = PositionId::new();
        let entry = Order::compute_client_id(&wallet, Some(&position), OrderKind::Entry, 0);
        let tp = Order::compute_client_id(&wallet, Some(&position), OrderKind::TakeProfit, 0);
        let tp_retry = Order::compute_client_id(&wallet, Some(&position), OrderKind::TakeProfit, 1);
        assert_ne!(entry, tp);
        assert_ne!(tp, tp_retry);
    }

    #[test]
    fn test_new_order_is_pending_and_live() {
        let order = Order::new(
            WalletId::new("main"),
            Some(PositionId::new()),
            ProductId::new(2),
            OrderKind::Close,
            Side::Short,
            None,
            d("0.5"),
            0,
        );
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.is_live());
        assert!(order.kind.is_reduce_only());
        assert_eq!(order.remaining_size(), d("0.5"));
    }

    #[test]
    fn test_kind_and_status_parse() {
        for kind in [
            OrderKind::Entry,
            OrderKind::TakeProfit,
            OrderKind::StopLoss,
            OrderKind::Close,
        ] {
            assert_eq!(OrderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(OrderStatus::parse("acked"), Some(OrderStatus::Acked));
        assert!(!OrderStatus::Filled.is_live());
    }
}
