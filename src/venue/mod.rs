//! Venue gateway abstraction: price queries, order placement/cancellation,
//! order status, balance and position queries against the external exchange.

use crate::domain::{Decimal, OrderKind, PriceSnapshot, ProductId, Side};
use crate::engine::WalletAccount;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod mock;
pub mod rest;
pub mod retry;

pub use mock::{MockOp, MockVenue};
pub use rest::RestVenueGateway;
pub use retry::{with_retry, RetryPolicy};

/// Venue gateway trait.
///
/// Every call may fail transiently. Implementations do not retry on their own;
/// the engine wraps calls in [`with_retry`] so attempts stay bounded and
/// `Rejected` is never resubmitted.
#[async_trait]
pub trait VenueGateway: Send + Sync + fmt::Debug {
    /// Current prices for a product.
    async fn get_price(&self, product_id: ProductId) -> Result<PriceSnapshot, VenueError>;

    /// Submit an order. Submitting the same `client_id` twice must not create
    /// a second order; the venue answers with the original handle.
    async fn place_order(
        &self,
        account: &WalletAccount,
        request: &OrderRequest,
    ) -> Result<OrderHandle, VenueError>;

    /// Cancel a live order by its venue id.
    async fn cancel_order(
        &self,
        account: &WalletAccount,
        product_id: ProductId,
        venue_order_id: &str,
    ) -> Result<(), VenueError>;

    /// Look up an order by client id. `NotFound` means the venue never saw it.
    async fn order_status(
        &self,
        account: &WalletAccount,
        product_id: ProductId,
        client_id: &str,
    ) -> Result<OrderStatusReport, VenueError>;

    /// All non-flat positions of the wallet.
    async fn get_positions(&self, account: &WalletAccount)
        -> Result<Vec<VenuePosition>, VenueError>;

    async fn get_balance(&self, account: &WalletAccount) -> Result<Balance, VenueError>;
}

/// Order submission payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: String,
    pub product_id: ProductId,
    pub side: Side,
    pub size: Decimal,
    /// None for market orders; trigger price for TP/SL orders.
    pub price: Option<Decimal>,
    pub kind: OrderKind,
    pub reduce_only: bool,
    pub leverage: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub venue_order_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueOrderState {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl VenueOrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VenueOrderState::Filled | VenueOrderState::Cancelled | VenueOrderState::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub venue_order_id: String,
    pub client_id: String,
    pub state: VenueOrderState,
    /// Cumulative filled size.
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Venue-reported position for one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub product_id: ProductId,
    /// Positive long, negative short.
    pub signed_size: Decimal,
    pub entry_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
}

/// Error type for venue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueError {
    /// Connection failure, DNS failure, reset.
    NetworkError(String),
    /// A call exceeded its deadline; the outcome is unknown.
    Timeout(u64),
    RateLimited,
    HttpError { status: u16, message: String },
    /// Venue-side validation failure (margin, notional, leverage cap).
    Rejected(String),
    NotFound(String),
    /// Credentials refused.
    Unauthorized(String),
    ParseError(String),
}

impl VenueError {
    /// Network, timeout, rate-limit and 5xx failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            VenueError::NetworkError(_) | VenueError::Timeout(_) | VenueError::RateLimited => true,
            VenueError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl fmt::Display for VenueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            VenueError::Timeout(ms) => write!(f, "Timed out after {}ms", ms),
            VenueError::RateLimited => write!(f, "Rate limited"),
            VenueError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            VenueError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            VenueError::NotFound(msg) => write!(f, "Not found: {}", msg),
            VenueError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            VenueError::ParseError(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for VenueError {}
