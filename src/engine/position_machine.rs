//! Lifecycle of a single position.
//!
//! `PendingEntry -> Open -> PendingExit -> Closed`, with `Errored` absorbing.
//! Every operation holds the position's lock for its whole duration, so at
//! most one venue action is in flight per position. Each order is persisted
//! as `Pending` before it is submitted, and each transition is persisted
//! before the operation returns.

use super::wallet::WalletServices;
use crate::domain::{
    Decimal, Order, OrderId, OrderKind, OrderStatus, Position, PositionId, PositionState,
    ProductId, Side, StrategyType, TimeMs, TpSlKind, TpSlRule, TpSlSpec,
};
use crate::db::StateDelta;
use crate::error::EngineError;
use crate::notify::EngineEvent;
use crate::venue::{OrderHandle, OrderRequest, OrderStatusReport, VenueError, VenueOrderState};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Parameters for opening a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub product_id: ProductId,
    pub side: Side,
    pub size: Decimal,
    pub leverage: u32,
    pub strategy: Option<StrategyType>,
}

/// A position with its orders and rules.
#[derive(Debug, Clone)]
struct Book {
    position: Position,
    orders: Vec<Order>,
    rules: Vec<TpSlRule>,
}

impl Book {
    fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == id)
    }

    fn order_mut(&mut self, id: OrderId) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.id == id)
    }

    fn live_order(&self, kind: OrderKind) -> Option<&Order> {
        self.orders.iter().rev().find(|o| o.kind == kind && o.is_live())
    }

    fn latest(&self, kind: OrderKind) -> Option<&Order> {
        self.orders.iter().rev().find(|o| o.kind == kind)
    }

    /// Next attempt number for a kind; also the client id discriminator.
    fn attempts(&self, kind: OrderKind) -> u32 {
        self.orders.iter().filter(|o| o.kind == kind).count() as u32
    }

    fn rule(&self, kind: TpSlKind) -> Option<&TpSlRule> {
        self.rules.iter().find(|r| r.kind == kind)
    }

    fn rule_mut(&mut self, kind: TpSlKind) -> Option<&mut TpSlRule> {
        self.rules.iter_mut().find(|r| r.kind == kind)
    }

    /// One rule slot per kind; a replacement overwrites the old rule.
    fn set_rule(&mut self, rule: TpSlRule) {
        match self.rule_mut(rule.kind) {
            Some(slot) => *slot = rule,
            None => self.rules.push(rule),
        }
    }

    fn filled(&self, entry: bool) -> (Decimal, Decimal) {
        self.orders
            .iter()
            .filter(|o| (o.kind == OrderKind::Entry) == entry && o.filled_size.is_positive())
            .fold((Decimal::zero(), Decimal::zero()), |(size, value), o| {
                let price = o.avg_fill_price.unwrap_or_default();
                (size + o.filled_size, value + o.filled_size * price)
            })
    }

    /// Derive size and entry price from the venue-reported fills.
    fn recompute(&mut self) {
        let (entered, entry_value) = self.filled(true);
        let (exited, _) = self.filled(false);
        self.position.size = (entered - exited).max(Decimal::zero());
        if entered.is_positive() {
            self.position.entry_price = entry_value.checked_div(entered);
        }
    }

    fn exit_price(&self) -> Option<Decimal> {
        let (exited, exit_value) = self.filled(false);
        if exited.is_positive() {
            exit_value.checked_div(exited)
        } else {
            None
        }
    }

    fn realized_pnl(&self) -> Option<Decimal> {
        let entry = self.position.entry_price?;
        let exit = self.exit_price()?;
        let (exited, _) = self.filled(false);
        let per_unit = match self.position.side {
            Side::Long => exit - entry,
            Side::Short => entry - exit,
        };
        Some(per_unit * exited)
    }

    /// Apply state transitions implied by the orders. Returns the event to
    /// emit once the result is persisted.
    fn settle(&mut self) -> Option<EngineEvent> {
        self.recompute();
        for rule in self.rules.iter_mut().filter(|r| r.active) {
            let rejected = rule
                .order_id
                .and_then(|id| self.orders.iter().find(|o| o.id == id))
                .is_some_and(|o| o.status == OrderStatus::Rejected);
            if rejected {
                rule.active = false;
            }
        }

        let now = TimeMs::now();
        let (entered, _) = self.filled(true);
        match self.position.state {
            PositionState::PendingEntry => {
                let status = self.latest(OrderKind::Entry)?.status;
                match status {
                    OrderStatus::Filled => Some(self.mark_open(now)),
                    OrderStatus::Cancelled | OrderStatus::Rejected if entered.is_positive() => {
                        Some(self.mark_open(now))
                    }
                    OrderStatus::Rejected => {
                        self.position.state = PositionState::Errored;
                        if self.position.error.is_none() {
                            self.position.error = Some("entry order rejected".to_string());
                        }
                        None
                    }
                    OrderStatus::Cancelled => {
                        // never filled, never exposed
                        self.position.state = PositionState::Closed;
                        self.position.closed_at = Some(now);
                        None
                    }
                    OrderStatus::Pending | OrderStatus::Acked => None,
                }
            }
            PositionState::Open | PositionState::PendingExit
                if entered.is_positive() && self.position.size.is_zero() =>
            {
                Some(self.mark_closed(now))
            }
            PositionState::PendingExit => {
                let close = self.latest(OrderKind::Close)?;
                if close.status == OrderStatus::Rejected {
                    self.position.state = PositionState::Errored;
                    if self.position.error.is_none() {
                        self.position.error = Some("close order rejected".to_string());
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn mark_open(&mut self, now: TimeMs) -> EngineEvent {
        let position = &mut self.position;
        position.state = PositionState::Open;
        position.opened_at = Some(now);
        EngineEvent::PositionOpened {
            wallet_id: position.wallet_id.clone(),
            position_id: position.id,
            product_id: position.product_id,
            side: position.side,
            size: position.size,
            entry_price: position.entry_price.unwrap_or_default(),
            strategy: position.strategy,
        }
    }

    fn mark_closed(&mut self, now: TimeMs) -> EngineEvent {
        let exit_price = self.exit_price();
        let realized_pnl = self.realized_pnl();
        for rule in &mut self.rules {
            rule.active = false;
        }
        let position = &mut self.position;
        position.state = PositionState::Closed;
        position.closed_at = Some(now);
        position.exit_price = exit_price;
        EngineEvent::PositionClosed {
            wallet_id: position.wallet_id.clone(),
            position_id: position.id,
            product_id: position.product_id,
            side: position.side,
            exit_price,
            realized_pnl,
        }
    }

    fn delta(&self) -> StateDelta {
        let mut delta = StateDelta::new().position(&self.position);
        for order in &self.orders {
            delta = delta.order(order);
        }
        for rule in &self.rules {
            delta = delta.rule(rule);
        }
        delta
    }
}

/// Fold a venue status report into the local order. Returns true on change.
fn apply_report(order: &mut Order, report: &OrderStatusReport) -> bool {
    let before = order.clone();
    order.venue_order_id = Some(report.venue_order_id.clone());
    if report.filled_size > order.filled_size {
        order.filled_size = report.filled_size;
    }
    if report.avg_fill_price.is_some() {
        order.avg_fill_price = report.avg_fill_price;
    }
    order.status = match report.state {
        VenueOrderState::Open | VenueOrderState::PartiallyFilled => OrderStatus::Acked,
        VenueOrderState::Filled => OrderStatus::Filled,
        VenueOrderState::Cancelled => OrderStatus::Cancelled,
        VenueOrderState::Rejected => OrderStatus::Rejected,
    };
    let changed = *order != before;
    if changed {
        order.touch();
    }
    changed
}

/// Owns one position. See the module docs for the lifecycle.
#[derive(Debug)]
pub struct PositionStateMachine {
    id: PositionId,
    services: Arc<WalletServices>,
    book: Mutex<Book>,
    /// Last persisted copy, readable without waiting for the lock.
    view: RwLock<Book>,
}

impl PositionStateMachine {
    pub(crate) fn new(services: Arc<WalletServices>, position: Position) -> Self {
        Self::restore(services, position, Vec::new(), Vec::new())
    }

    pub(crate) fn restore(
        services: Arc<WalletServices>,
        position: Position,
        mut orders: Vec<Order>,
        rules: Vec<TpSlRule>,
    ) -> Self {
        orders.sort_by_key(|o| (o.submitted_at, o.id));
        let book = Book {
            position,
            orders,
            rules,
        };
        Self {
            id: book.position.id,
            services,
            view: RwLock::new(book.clone()),
            book: Mutex::new(book),
        }
    }

    pub fn id(&self) -> PositionId {
        self.id
    }

    fn view(&self) -> std::sync::RwLockReadGuard<'_, Book> {
        self.view.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn position(&self) -> Position {
        self.view().position.clone()
    }

    pub fn state(&self) -> PositionState {
        self.view().position.state
    }

    pub fn product_id(&self) -> ProductId {
        self.view().position.product_id
    }

    pub fn orders(&self) -> Vec<Order> {
        self.view().orders.clone()
    }

    pub fn rules(&self) -> Vec<TpSlRule> {
        self.view().rules.clone()
    }

    pub fn active_rule(&self, kind: TpSlKind) -> Option<TpSlRule> {
        self.view().rule(kind).filter(|r| r.active).cloned()
    }

    pub fn live_orders(&self, kind: OrderKind) -> usize {
        self.view()
            .orders
            .iter()
            .filter(|o| o.kind == kind && o.is_live())
            .count()
    }

    pub(crate) fn has_resting_exit_orders(&self) -> bool {
        self.view().orders.iter().any(|o| {
            o.is_live() && matches!(o.kind, OrderKind::TakeProfit | OrderKind::StopLoss)
        })
    }

    /// Wait until no operation is running on this position.
    pub async fn wait_idle(&self) {
        let _book = self.book.lock().await;
    }

    async fn commit(&self, book: &Book) -> Result<(), EngineError> {
        self.services
            .store
            .save_state(&self.services.account.id, book.delta())
            .await?;
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = book.clone();
        Ok(())
    }

    /// Persist, clean up after a close, then publish the event.
    async fn finish(&self, book: &mut Book, event: Option<EngineEvent>) -> Result<(), EngineError> {
        if book.position.state == PositionState::Closed {
            self.cancel_leftovers(book).await;
        }
        self.commit(book).await?;
        if let Some(event) = event {
            match &event {
                EngineEvent::PositionOpened { entry_price, size, .. } => info!(
                    wallet = %book.position.wallet_id,
                    position_id = %self.id,
                    product = %book.position.product_id,
                    side = %book.position.side,
                    size = %size,
                    entry_price = %entry_price,
                    "Position opened"
                ),
                EngineEvent::PositionClosed { exit_price, .. } => info!(
                    wallet = %book.position.wallet_id,
                    position_id = %self.id,
                    exit_price = ?exit_price,
                    "Position closed"
                ),
                _ => {}
            }
            self.services.notifier.notify(event);
        }
        Ok(())
    }

    fn request(&self, order: &Order, leverage: u32) -> OrderRequest {
        OrderRequest {
            client_id: order.client_id.clone(),
            product_id: order.product_id,
            side: order.side,
            size: order.requested_size,
            price: order.requested_price,
            kind: order.kind,
            reduce_only: order.kind.is_reduce_only(),
            leverage,
        }
    }

    async fn place(&self, order: &Order, leverage: u32) -> Result<OrderHandle, VenueError> {
        let request = self.request(order, leverage);
        let s = &self.services;
        s.call("place_order", || s.venue.place_order(&s.account, &request)).await
    }

    async fn status(&self, order: &Order) -> Result<OrderStatusReport, VenueError> {
        let s = &self.services;
        s.call("order_status", || {
            s.venue
                .order_status(&s.account, order.product_id, &order.client_id)
        })
        .await
    }

    async fn cancel(&self, product_id: ProductId, venue_order_id: &str) -> Result<(), VenueError> {
        let s = &self.services;
        s.call("cancel_order", || {
            s.venue.cancel_order(&s.account, product_id, venue_order_id)
        })
        .await
    }

    async fn poll_order(&self, book: &mut Book, order_id: OrderId) -> Result<(), VenueError> {
        let Some(order) = book.order(order_id).cloned() else {
            return Ok(());
        };
        let report = self.status(&order).await?;
        if let Some(order) = book.order_mut(order_id) {
            apply_report(order, &report);
        }
        Ok(())
    }

    /// Submit an order that is already persisted as pending and record the outcome.
    async fn submit(&self, book: &mut Book, order_id: OrderId) -> Result<(), EngineError> {
        let Some(order) = book.order(order_id).cloned() else {
            return Ok(());
        };
        debug!(
            wallet = %order.wallet_id,
            position_id = %self.id,
            order_id = %order.id,
            kind = %order.kind,
            client_id = %order.client_id,
            "Submitting order"
        );
        match self.place(&order, book.position.leverage).await {
            Ok(handle) => {
                if let Some(order) = book.order_mut(order_id) {
                    order.venue_order_id = Some(handle.venue_order_id);
                    if order.status == OrderStatus::Pending {
                        order.status = OrderStatus::Acked;
                    }
                    order.touch();
                }
                if let Err(e) = self.poll_order(book, order_id).await {
                    debug!(order_id = %order.id, error = %e, "Fill confirmation deferred");
                }
                Ok(())
            }
            Err(VenueError::Rejected(reason)) => {
                warn!(
                    wallet = %order.wallet_id,
                    position_id = %self.id,
                    kind = %order.kind,
                    reason = %reason,
                    "Order rejected by venue"
                );
                if let Some(order) = book.order_mut(order_id) {
                    order.status = OrderStatus::Rejected;
                    order.touch();
                }
                if matches!(order.kind, OrderKind::Entry | OrderKind::Close) {
                    book.position.error = Some(format!("{} order rejected: {}", order.kind, reason));
                }
                Err(EngineError::OrderRejected(reason))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take a live order off the venue, or learn that it already finished.
    async fn retire(&self, book: &mut Book, order_id: OrderId) -> Result<(), EngineError> {
        let Some(order) = book.order(order_id).cloned() else {
            return Ok(());
        };
        if order.venue_order_id.is_none() {
            match self.poll_order(book, order_id).await {
                Ok(()) => {}
                Err(VenueError::NotFound(_)) => {
                    if let Some(order) = book.order_mut(order_id) {
                        order.status = OrderStatus::Cancelled;
                        order.touch();
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some(order) = book.order(order_id).cloned() else {
            return Ok(());
        };
        let Some(venue_order_id) = order.venue_order_id.clone().filter(|_| order.is_live()) else {
            return Ok(());
        };
        match self.cancel(order.product_id, &venue_order_id).await {
            Ok(()) => {
                // The cancel ack does not carry fills that raced it. Without a
                // status report the order stays live for the next refresh.
                self.poll_order(book, order_id).await?;
                if let Some(order) = book.order_mut(order_id) {
                    if order.is_live() {
                        order.status = OrderStatus::Cancelled;
                        order.touch();
                    }
                }
                Ok(())
            }
            Err(VenueError::NotFound(_)) => {
                self.poll_order(book, order_id).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort cancel of everything still resting once the position is flat.
    async fn cancel_leftovers(&self, book: &mut Book) {
        let live: Vec<OrderId> = book
            .orders
            .iter()
            .filter(|o| o.is_live())
            .map(|o| o.id)
            .collect();
        for order_id in live {
            if let Err(e) = self.retire(book, order_id).await {
                warn!(position_id = %self.id, order_id = %order_id, error = %e, "Failed to cancel leftover order");
            }
        }
    }

    /// Write the entry order ahead, submit it and confirm the fill.
    pub(crate) async fn submit_entry(&self) -> Result<(), EngineError> {
        let mut book = self.book.lock().await;
        let position = &book.position;
        let order = Order::new(
            position.wallet_id.clone(),
            Some(position.id),
            position.product_id,
            OrderKind::Entry,
            position.side,
            None,
            position.requested_size,
            book.attempts(OrderKind::Entry),
        );
        let order_id = order.id;
        book.orders.push(order);
        self.commit(&book).await?;

        let submitted = self.submit(&mut book, order_id).await;
        let event = book.settle();
        self.finish(&mut book, event).await?;
        submitted
    }

    /// Attach a take-profit or stop-loss to an open position.
    ///
    /// Re-attaching the same target is a no-op. A different target cancels
    /// the current order first and places the replacement only after the
    /// cancel is confirmed.
    pub async fn attach_tp_sl(&self, spec: TpSlSpec) -> Result<(), EngineError> {
        let mut book = self.book.lock().await;
        self.require_open(&book)?;
        let position = book.position.clone();
        let entry = position.entry_price.ok_or(EngineError::InvalidState {
            position_id: self.id,
            state: position.state,
            expected: "filled entry",
        })?;
        let rule = TpSlRule::resolve(self.id, spec, position.side, entry);
        let order_kind = spec.kind.order_kind();

        if let Some(existing) = book.rule(spec.kind).filter(|r| r.active) {
            let backed = existing
                .order_id
                .and_then(|id| book.order(id))
                .is_some_and(Order::is_live);
            if backed && existing.target_price == rule.target_price {
                debug!(position_id = %self.id, kind = %spec.kind, target = %rule.target_price, "Rule already attached");
                return Ok(());
            }
        }

        if let Some(live) = book.live_order(order_kind).map(|o| o.id) {
            let retired = self.retire(&mut book, live).await;
            if let Some(slot) = book.rule_mut(spec.kind) {
                slot.active = false;
            }
            let event = book.settle();
            self.finish(&mut book, event).await?;
            retired?;
            self.require_open(&book)?;
        }

        let order = Order::new(
            position.wallet_id.clone(),
            Some(self.id),
            position.product_id,
            order_kind,
            position.side.opposite(),
            Some(rule.target_price),
            book.position.size,
            book.attempts(order_kind),
        );
        let order_id = order.id;
        let mut rule = rule;
        rule.order_id = Some(order_id);
        info!(
            wallet = %position.wallet_id,
            position_id = %self.id,
            kind = %spec.kind,
            mode = spec.mode.as_str(),
            target = %rule.target_price,
            "Attaching rule"
        );
        book.set_rule(rule);
        book.orders.push(order);
        self.commit(&book).await?;

        let submitted = self.submit(&mut book, order_id).await;
        let event = book.settle();
        self.finish(&mut book, event).await?;
        submitted
    }

    /// Attach several rules, trying each even if an earlier one fails.
    pub async fn attach_all(&self, specs: &[TpSlSpec]) -> Result<(), EngineError> {
        let mut first_err = None;
        for spec in specs {
            if let Err(e) = self.attach_tp_sl(*spec).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Close the full remaining size.
    ///
    /// Resting TP/SL orders are cancelled first. A partial fill leaves the
    /// position in `PendingExit` with the reduced size; `refresh` drives it
    /// to `Closed`.
    pub async fn close(&self) -> Result<(), EngineError> {
        let mut book = self.book.lock().await;
        match book.position.state {
            PositionState::Closed => return Ok(()),
            PositionState::Errored => return Err(EngineError::PositionErrored(self.id)),
            PositionState::PendingEntry => {
                return Err(EngineError::InvalidState {
                    position_id: self.id,
                    state: PositionState::PendingEntry,
                    expected: "open",
                })
            }
            PositionState::PendingExit if book.live_order(OrderKind::Close).is_some() => {
                return Ok(())
            }
            PositionState::Open | PositionState::PendingExit => {}
        }

        for kind in [OrderKind::TakeProfit, OrderKind::StopLoss] {
            if let Some(live) = book.live_order(kind).map(|o| o.id) {
                if let Err(e) = self.retire(&mut book, live).await {
                    let event = book.settle();
                    self.finish(&mut book, event).await?;
                    return Err(e);
                }
            }
        }
        for rule in &mut book.rules {
            rule.active = false;
        }

        let event = book.settle();
        if book.position.state.is_terminal() {
            return self.finish(&mut book, event).await;
        }
        self.submit_close(&mut book).await
    }

    async fn submit_close(&self, book: &mut Book) -> Result<(), EngineError> {
        book.position.state = PositionState::PendingExit;
        let position = &book.position;
        let order = Order::new(
            position.wallet_id.clone(),
            Some(self.id),
            position.product_id,
            OrderKind::Close,
            position.side.opposite(),
            None,
            position.size,
            book.attempts(OrderKind::Close),
        );
        info!(
            wallet = %position.wallet_id,
            position_id = %self.id,
            size = %position.size,
            "Closing position"
        );
        let order_id = order.id;
        book.orders.push(order);
        self.commit(book).await?;

        let submitted = self.submit(book, order_id).await;
        let event = book.settle();
        self.finish(book, event).await?;
        submitted
    }

    /// Poll live orders, apply fills and push unfinished work forward.
    ///
    /// Unconfirmed orders the venue never saw are resubmitted with their
    /// original client id. An exit whose close order ended short of flat gets
    /// a new close order for the remainder.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.sync(true).await
    }

    /// Resolve unconfirmed orders against the venue without resubmitting.
    /// Orders the venue never saw are treated as cancelled.
    pub async fn resolve_unconfirmed(&self) -> Result<(), EngineError> {
        self.sync(false).await
    }

    async fn sync(&self, resubmit: bool) -> Result<(), EngineError> {
        let mut book = self.book.lock().await;
        if book.position.state.is_terminal() {
            return Ok(());
        }

        let mut outcome = Ok(());
        let live: Vec<(OrderId, bool)> = book
            .orders
            .iter()
            .filter(|o| o.is_live())
            .map(|o| (o.id, o.venue_order_id.is_none()))
            .collect();
        for (order_id, unconfirmed) in live {
            let result = match self.poll_order(&mut book, order_id).await {
                Err(VenueError::NotFound(_)) if unconfirmed && resubmit => {
                    self.submit(&mut book, order_id).await
                }
                Err(VenueError::NotFound(_)) if unconfirmed => {
                    if let Some(order) = book.order_mut(order_id) {
                        info!(order_id = %order.id, kind = %order.kind, "Order never reached the venue");
                        order.status = OrderStatus::Cancelled;
                        order.touch();
                    }
                    Ok(())
                }
                Err(e) => Err(e.into()),
                Ok(()) => Ok(()),
            };
            if let Err(e) = result {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        let event = book.settle();
        let needs_remainder = resubmit
            && book.position.state == PositionState::PendingExit
            && book.position.size.is_positive()
            && book.live_order(OrderKind::Close).is_none();
        self.finish(&mut book, event).await?;
        if needs_remainder {
            self.submit_close(&mut book).await?;
        }
        outcome
    }

    /// Move to `Errored`. Resting orders are left alone for the operator.
    pub async fn mark_errored(&self, reason: impl Into<String>) -> Result<(), EngineError> {
        let mut book = self.book.lock().await;
        if book.position.state.is_terminal() {
            return Ok(());
        }
        let reason = reason.into();
        error!(
            wallet = %book.position.wallet_id,
            position_id = %self.id,
            product = %book.position.product_id,
            reason = %reason,
            "Position errored"
        );
        book.position.state = PositionState::Errored;
        book.position.error = Some(reason);
        self.commit(&book).await
    }

    /// Set the in-flight flag of an active rule. False when it was already
    /// set, inactive, or the position is no longer open.
    pub async fn mark_triggered(&self, kind: TpSlKind) -> Result<bool, EngineError> {
        let mut book = self.book.lock().await;
        if book.position.state != PositionState::Open {
            return Ok(false);
        }
        match book.rule_mut(kind) {
            Some(rule) if rule.active && !rule.triggered => rule.triggered = true,
            _ => return Ok(false),
        }
        self.commit(&book).await?;
        Ok(true)
    }

    /// Clear the flag after a failed close that left the position open.
    pub async fn clear_trigger(&self, kind: TpSlKind) -> Result<(), EngineError> {
        let mut book = self.book.lock().await;
        let open = book.position.state == PositionState::Open;
        match book.rule_mut(kind) {
            Some(rule) if rule.triggered && open => {
                rule.triggered = false;
                rule.active = true;
            }
            _ => return Ok(()),
        }
        self.commit(&book).await
    }

    fn require_open(&self, book: &Book) -> Result<(), EngineError> {
        match book.position.state {
            PositionState::Open => Ok(()),
            PositionState::Errored => Err(EngineError::PositionErrored(self.id)),
            state => Err(EngineError::InvalidState {
                position_id: self.id,
                state,
                expected: "open",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProductId, WalletId};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn book(side: Side) -> Book {
        Book {
            position: Position::pending(
                WalletId::new("main"),
                ProductId::new(2),
                side,
                d("1"),
                1,
                None,
            ),
            orders: Vec::new(),
            rules: Vec::new(),
        }
    }

    fn filled(book: &Book, kind: OrderKind, size: &str, price: &str, status: OrderStatus) -> Order {
        let mut order = Order::new(
            book.position.wallet_id.clone(),
            Some(book.position.id),
            book.position.product_id,
            kind,
            book.position.side,
            None,
            d("1"),
            book.attempts(kind),
        );
        order.filled_size = d(size);
        order.avg_fill_price = Some(d(price));
        order.status = status;
        order
    }

    #[test]
    fn test_settle_opens_on_filled_entry_with_venue_price() {
        let mut book = book(Side::Long);
        let entry = filled(&book, OrderKind::Entry, "1", "100.00", OrderStatus::Filled);
        book.orders.push(entry);
        let event = book.settle();
        assert_eq!(book.position.state, PositionState::Open);
        assert_eq!(book.position.entry_price, Some(d("100")));
        assert!(matches!(event, Some(EngineEvent::PositionOpened { .. })));
    }

    #[test]
    fn test_settle_partial_exit_stays_pending() {
        let mut book = book(Side::Long);
        let entry = filled(&book, OrderKind::Entry, "1", "100", OrderStatus::Filled);
        book.orders.push(entry);
        book.settle();
        book.position.state = PositionState::PendingExit;
        let close = filled(&book, OrderKind::Close, "0.4", "101", OrderStatus::Acked);
        book.orders.push(close);
        assert!(book.settle().is_none());
        assert_eq!(book.position.size, d("0.6"));
        assert_eq!(book.position.state, PositionState::PendingExit);
    }

    #[test]
    fn test_settle_closed_reports_pnl_for_short() {
        let mut book = book(Side::Short);
        let entry = filled(&book, OrderKind::Entry, "1", "100", OrderStatus::Filled);
        book.orders.push(entry);
        book.settle();
        book.position.state = PositionState::PendingExit;
        let close = filled(&book, OrderKind::Close, "1", "98", OrderStatus::Filled);
        book.orders.push(close);
        match book.settle() {
            Some(EngineEvent::PositionClosed {
                exit_price,
                realized_pnl,
                ..
            }) => {
                assert_eq!(exit_price, Some(d("98")));
                assert_eq!(realized_pnl, Some(d("2")));
            }
            other => panic!("expected close event, got {:?}", other),
        }
        assert_eq!(book.position.state, PositionState::Closed);
    }

    #[test]
    fn test_cancelled_unfilled_entry_closes_without_event() {
        let mut book = book(Side::Long);
        let entry = filled(&book, OrderKind::Entry, "0", "0", OrderStatus::Cancelled);
        book.orders.push(entry);
        assert!(book.settle().is_none());
        assert_eq!(book.position.state, PositionState::Closed);
    }

    #[test]
    fn test_rejected_rule_order_deactivates_rule() {
        let mut book = book(Side::Long);
        let entry = filled(&book, OrderKind::Entry, "1", "100", OrderStatus::Filled);
        book.orders.push(entry);
        book.settle();
        let tp = filled(&book, OrderKind::TakeProfit, "0", "0", OrderStatus::Rejected);
        let mut rule = TpSlRule::resolve(
            book.position.id,
            TpSlSpec::take_profit_pct(d("1")),
            Side::Long,
            d("100"),
        );
        rule.order_id = Some(tp.id);
        book.orders.push(tp);
        book.set_rule(rule);
        book.settle();
        assert!(!book.rule(TpSlKind::TakeProfit).unwrap().active);
        assert_eq!(book.position.state, PositionState::Open);
    }
}
