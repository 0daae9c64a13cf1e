//! In-memory venue for tests and dry runs.
//!
//! Market orders fill immediately at the product's mark price; TP/SL orders
//! rest until cancelled or filled through [`MockVenue::fill_order`]. Orders
//! are deduplicated by client id the way the real venue does it.

use super::{
    Balance, OrderHandle, OrderRequest, OrderStatusReport, VenueError, VenueGateway,
    VenueOrderState, VenuePosition,
};
use crate::domain::{Decimal, OrderKind, PriceSnapshot, ProductId, Side, TimeMs, WalletId};
use crate::engine::WalletAccount;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Venue operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Price,
    Place,
    Cancel,
    Status,
    Positions,
    Balance,
}

#[derive(Debug, Clone)]
struct MockOrder {
    wallet_id: WalletId,
    venue_order_id: String,
    request: OrderRequest,
    state: VenueOrderState,
    filled_size: Decimal,
    avg_fill_price: Option<Decimal>,
}

impl MockOrder {
    fn report(&self) -> OrderStatusReport {
        OrderStatusReport {
            venue_order_id: self.venue_order_id.clone(),
            client_id: self.request.client_id.clone(),
            state: self.state,
            filled_size: self.filled_size,
            avg_fill_price: self.avg_fill_price,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    prices: HashMap<ProductId, PriceSnapshot>,
    balance: Option<Balance>,
    orders: HashMap<String, MockOrder>,
    positions: HashMap<(WalletId, ProductId), (Decimal, Option<Decimal>)>,
    failures: HashMap<MockOp, VecDeque<VenueError>>,
    /// Orders accepted by the venue whose acknowledgement is lost in transit.
    lost_acks: u32,
    /// Size cap for the next market fill; the rest stays open.
    partial_fill: Option<Decimal>,
    /// Size that fills on the next cancelled order just before the cancel lands.
    fill_on_cancel: Option<Decimal>,
    delays: HashMap<OrderKind, Duration>,
    unauthorized: bool,
    place_calls: usize,
    next_id: u64,
}

/// Scriptable in-memory venue. Clones share state.
#[derive(Debug, Clone)]
pub struct MockVenue {
    inner: Arc<Mutex<MockState>>,
    place_started: Arc<Notify>,
}

impl MockVenue {
    /// Create an empty venue with a default balance of 10,000.
    pub fn new() -> Self {
        let state = MockState {
            balance: Some(Balance {
                total: Decimal::from_i64(10_000),
                available: Decimal::from_i64(10_000),
            }),
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            place_started: Arc::new(Notify::new()),
        }
    }

    /// Set a flat price (bid = ask = mark) for a product.
    pub fn with_price(self, product_id: ProductId, price: Decimal) -> Self {
        self.set_price(product_id, price);
        self
    }

    pub fn with_balance(self, available: Decimal) -> Self {
        self.state().balance = Some(Balance {
            total: available,
            available,
        });
        self
    }

    /// Delay every `place_order` of this kind, simulating a slow venue.
    pub fn with_place_delay(self, kind: OrderKind, delay: Duration) -> Self {
        self.state().delays.insert(kind, delay);
        self
    }

    pub fn set_price(&self, product_id: ProductId, price: Decimal) {
        self.state().prices.insert(
            product_id,
            PriceSnapshot::flat(product_id, price, TimeMs::now()),
        );
    }

    /// Queue `count` failures of `err` for the next calls of `op`.
    pub fn fail_next(&self, op: MockOp, err: VenueError, count: usize) {
        let mut state = self.state();
        let queue = state.failures.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    /// The next `count` placements are accepted but answer with a network error.
    pub fn lose_next_acks(&self, count: u32) {
        self.state().lost_acks += count;
    }

    /// The next market order fills at most `size`; the remainder stays open.
    pub fn partial_fill_next(&self, size: Decimal) {
        self.state().partial_fill = Some(size);
    }

    /// The next cancel races a fill of `size`: the order fills that much at
    /// the mark, then the cancel is acknowledged.
    pub fn fill_before_next_cancel(&self, size: Decimal) {
        self.state().fill_on_cancel = Some(size);
    }

    /// Refuse every wallet-scoped call with `Unauthorized`.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.state().unauthorized = unauthorized;
    }

    /// Overwrite the venue's position for a wallet and product.
    pub fn set_position(&self, wallet_id: &WalletId, product_id: ProductId, signed_size: Decimal) {
        let mut state = self.state();
        let key = (wallet_id.clone(), product_id);
        if signed_size.is_zero() {
            state.positions.remove(&key);
        } else {
            let entry = state.prices.get(&product_id).map(|p| p.mark);
            state.positions.insert(key, (signed_size, entry));
        }
    }

    /// Fill the open remainder of an order at the current mark price.
    pub fn fill_order(&self, client_id: &str) -> Result<(), VenueError> {
        let mut state = self.state();
        let order = state
            .orders
            .get(client_id)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(client_id.to_string()))?;
        if order.state.is_terminal() {
            return Ok(());
        }
        let price = state.mark(order.request.product_id)?;
        let remaining = order.request.size - order.filled_size;
        state.apply_fill(client_id, remaining, price);
        Ok(())
    }

    /// Resolves each time a `place_order` call starts.
    pub fn place_started(&self) -> Arc<Notify> {
        self.place_started.clone()
    }

    /// Distinct orders the venue has recorded.
    pub fn order_count(&self) -> usize {
        self.state().orders.len()
    }

    /// Orders recorded for a product and kind, in no particular order.
    pub fn orders_of_kind(&self, product_id: ProductId, kind: OrderKind) -> Vec<OrderStatusReport> {
        self.state()
            .orders
            .values()
            .filter(|o| o.request.product_id == product_id && o.request.kind == kind)
            .map(MockOrder::report)
            .collect()
    }

    /// Resting (unfilled, uncancelled) orders of a kind.
    pub fn live_orders_of_kind(&self, product_id: ProductId, kind: OrderKind) -> usize {
        self.orders_of_kind(product_id, kind)
            .iter()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Total `place_order` calls received, including failed ones.
    pub fn place_calls(&self) -> usize {
        self.state().place_calls
    }

    pub fn position_of(&self, wallet_id: &WalletId, product_id: ProductId) -> Decimal {
        self.state()
            .positions
            .get(&(wallet_id.clone(), product_id))
            .map(|(size, _)| *size)
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self, op: MockOp) -> Result<(), VenueError> {
        match self.state().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_auth(&self) -> Result<(), VenueError> {
        if self.state().unauthorized {
            return Err(VenueError::Unauthorized("api key refused".to_string()));
        }
        Ok(())
    }
}

impl Default for MockVenue {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn mark(&self, product_id: ProductId) -> Result<Decimal, VenueError> {
        self.prices
            .get(&product_id)
            .map(|p| p.mark)
            .ok_or_else(|| VenueError::Rejected(format!("no market for {}", product_id)))
    }

    fn apply_fill(&mut self, client_id: &str, size: Decimal, price: Decimal) {
        let Some(order) = self.orders.get_mut(client_id) else {
            return;
        };
        let prior = order.filled_size;
        let total = prior + size;
        let avg = match order.avg_fill_price {
            Some(avg) if total.is_positive() => (avg * prior + price * size) / total,
            _ => price,
        };
        order.filled_size = total;
        order.avg_fill_price = Some(avg);
        order.state = if total >= order.request.size {
            VenueOrderState::Filled
        } else {
            VenueOrderState::PartiallyFilled
        };

        let delta = match order.request.side {
            Side::Long => size,
            Side::Short => -size,
        };
        let key = (order.wallet_id.clone(), order.request.product_id);
        let (current, entry) = self
            .positions
            .get(&key)
            .copied()
            .unwrap_or((Decimal::zero(), None));
        let next = current + delta;
        if next.is_zero() {
            self.positions.remove(&key);
            return;
        }
        let increasing = current.is_zero() || (current.is_positive() == delta.is_positive());
        let next_entry = if increasing {
            match entry {
                Some(e) if !current.is_zero() => {
                    Some((e * current.abs() + price * size) / next.abs())
                }
                _ => Some(price),
            }
        } else {
            entry
        };
        self.positions.insert(key, (next, next_entry));
    }
}

#[async_trait]
impl VenueGateway for MockVenue {
    async fn get_price(&self, product_id: ProductId) -> Result<PriceSnapshot, VenueError> {
        self.take_failure(MockOp::Price)?;
        self.state()
            .prices
            .get(&product_id)
            .copied()
            .ok_or_else(|| VenueError::NotFound(format!("price for {}", product_id)))
    }

    async fn place_order(
        &self,
        account: &WalletAccount,
        request: &OrderRequest,
    ) -> Result<OrderHandle, VenueError> {
        self.place_started.notify_one();
        let delay = {
            let mut state = self.state();
            state.place_calls += 1;
            state.delays.get(&request.kind).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_auth()?;

        let mut state = self.state();
        if let Some(existing) = state.orders.get(&request.client_id) {
            if existing.state == VenueOrderState::Rejected {
                return Err(VenueError::Rejected("duplicate of rejected order".to_string()));
            }
            return Ok(OrderHandle {
                venue_order_id: existing.venue_order_id.clone(),
                client_id: existing.request.client_id.clone(),
            });
        }

        let scripted = state
            .failures
            .get_mut(&MockOp::Place)
            .and_then(VecDeque::pop_front);
        state.next_id += 1;
        let venue_order_id = format!("mock-{}", state.next_id);
        let mut order = MockOrder {
            wallet_id: account.id.clone(),
            venue_order_id: venue_order_id.clone(),
            request: request.clone(),
            state: VenueOrderState::Open,
            filled_size: Decimal::zero(),
            avg_fill_price: None,
        };

        match scripted {
            Some(VenueError::Rejected(reason)) => {
                order.state = VenueOrderState::Rejected;
                state.orders.insert(request.client_id.clone(), order);
                return Err(VenueError::Rejected(reason));
            }
            Some(err) => return Err(err),
            None => {}
        }

        let market_fill = match request.kind {
            OrderKind::Entry | OrderKind::Close if request.price.is_none() => {
                Some(state.mark(request.product_id)?)
            }
            _ => None,
        };
        state.orders.insert(request.client_id.clone(), order);

        if let Some(price) = market_fill {
            let size = match state.partial_fill.take() {
                Some(cap) => cap.min(request.size),
                None => request.size,
            };
            state.apply_fill(&request.client_id, size, price);
        }

        if state.lost_acks > 0 {
            state.lost_acks -= 1;
            return Err(VenueError::NetworkError("connection reset".to_string()));
        }

        Ok(OrderHandle {
            venue_order_id,
            client_id: request.client_id.clone(),
        })
    }

    async fn cancel_order(
        &self,
        _account: &WalletAccount,
        _product_id: ProductId,
        venue_order_id: &str,
    ) -> Result<(), VenueError> {
        self.check_auth()?;
        self.take_failure(MockOp::Cancel)?;
        let mut state = self.state();
        let order = state
            .orders
            .values()
            .find(|o| o.venue_order_id == venue_order_id)
            .ok_or_else(|| VenueError::NotFound(venue_order_id.to_string()))?;
        if order.state.is_terminal() {
            return Err(VenueError::NotFound(format!(
                "{} is no longer open",
                venue_order_id
            )));
        }
        let client_id = order.request.client_id.clone();
        let product_id = order.request.product_id;
        let open_size = order.request.size - order.filled_size;

        if let Some(size) = state.fill_on_cancel.take() {
            let price = state.mark(product_id)?;
            state.apply_fill(&client_id, size.min(open_size), price);
        }
        if let Some(order) = state.orders.get_mut(&client_id) {
            if !order.state.is_terminal() {
                order.state = VenueOrderState::Cancelled;
            }
        }
        Ok(())
    }

    async fn order_status(
        &self,
        _account: &WalletAccount,
        _product_id: ProductId,
        client_id: &str,
    ) -> Result<OrderStatusReport, VenueError> {
        self.check_auth()?;
        self.take_failure(MockOp::Status)?;
        self.state()
            .orders
            .get(client_id)
            .map(MockOrder::report)
            .ok_or_else(|| VenueError::NotFound(client_id.to_string()))
    }

    async fn get_positions(
        &self,
        account: &WalletAccount,
    ) -> Result<Vec<VenuePosition>, VenueError> {
        self.check_auth()?;
        self.take_failure(MockOp::Positions)?;
        let state = self.state();
        let mut positions: Vec<VenuePosition> = state
            .positions
            .iter()
            .filter(|((wallet, _), _)| *wallet == account.id)
            .map(|((_, product_id), (size, entry))| VenuePosition {
                product_id: *product_id,
                signed_size: *size,
                entry_price: *entry,
            })
            .collect();
        positions.sort_by_key(|p| p.product_id);
        Ok(positions)
    }

    async fn get_balance(&self, _account: &WalletAccount) -> Result<Balance, VenueError> {
        self.check_auth()?;
        self.take_failure(MockOp::Balance)?;
        self.state()
            .balance
            .ok_or_else(|| VenueError::NotFound("balance".to_string()))
    }
}
