//! Engine events for external presentation.
//!
//! This is the only contract the chat and dashboard layers depend on. Events
//! serialize with a `type` tag (`position_opened`, `tp_sl_triggered`, ...).

use crate::domain::{Decimal, PositionId, ProductId, Side, StrategyType, TpSlKind, WalletId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PositionOpened {
        wallet_id: WalletId,
        position_id: PositionId,
        product_id: ProductId,
        side: Side,
        size: Decimal,
        entry_price: Decimal,
        strategy: Option<StrategyType>,
    },
    PositionClosed {
        wallet_id: WalletId,
        position_id: PositionId,
        product_id: ProductId,
        side: Side,
        exit_price: Option<Decimal>,
        /// Gross P&L from entry and exit fills, before fees.
        realized_pnl: Option<Decimal>,
    },
    TpSlTriggered {
        wallet_id: WalletId,
        position_id: PositionId,
        product_id: ProductId,
        kind: TpSlKind,
        target_price: Decimal,
        trigger_price: Decimal,
    },
    StrategyHalted {
        wallet_id: WalletId,
        strategy: StrategyType,
        reason: String,
    },
    ReconciliationMismatch {
        wallet_id: WalletId,
        product_id: ProductId,
        local_size: Decimal,
        venue_size: Decimal,
        positions: Vec<PositionId>,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::TpSlTriggered { .. } => "tp_sl_triggered",
            EngineEvent::StrategyHalted { .. } => "strategy_halted",
            EngineEvent::ReconciliationMismatch { .. } => "reconciliation_mismatch",
        }
    }

    pub fn wallet_id(&self) -> &WalletId {
        match self {
            EngineEvent::PositionOpened { wallet_id, .. }
            | EngineEvent::PositionClosed { wallet_id, .. }
            | EngineEvent::TpSlTriggered { wallet_id, .. }
            | EngineEvent::StrategyHalted { wallet_id, .. }
            | EngineEvent::ReconciliationMismatch { wallet_id, .. } => wallet_id,
        }
    }
}

/// Sink for engine events. Must not block the caller.
pub trait Notifier: Send + Sync + std::fmt::Debug {
    fn notify(&self, event: EngineEvent);
}

/// Fan-out over a tokio broadcast channel. Slow subscribers lag and skip.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Writes every event to the log as JSON.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: EngineEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match &event {
            EngineEvent::StrategyHalted { .. } | EngineEvent::ReconciliationMismatch { .. } => {
                warn!(event = event.name(), wallet = %event.wallet_id(), payload = %payload, "Engine event");
            }
            _ => {
                info!(event = event.name(), wallet = %event.wallet_id(), payload = %payload, "Engine event");
            }
        }
    }
}

/// Forwards to several notifiers in order.
#[derive(Debug, Default)]
pub struct FanoutNotifier {
    sinks: Vec<std::sync::Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<std::sync::Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, event: EngineEvent) {
        for sink in &self.sinks {
            sink.notify(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = EngineEvent::StrategyHalted {
            wallet_id: WalletId::new("main"),
            strategy: StrategyType::Grid,
            reason: "position errored".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "strategy_halted");
        assert_eq!(json["wallet_id"], "main");
        assert_eq!(json["strategy"], "grid");
    }

    #[test]
    fn test_decimals_serialize_as_strings() {
        let event = EngineEvent::ReconciliationMismatch {
            wallet_id: WalletId::new("main"),
            product_id: ProductId::new(2),
            local_size: Decimal::from_str_canonical("0.1").unwrap(),
            venue_size: Decimal::zero(),
            positions: vec![],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["local_size"], "0.1");
        assert_eq!(json["product_id"], 2);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.notify(EngineEvent::StrategyHalted {
            wallet_id: WalletId::new("main"),
            strategy: StrategyType::Ml,
            reason: "stopped".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "strategy_halted");
    }

    #[test]
    fn test_broadcast_without_subscribers_does_not_panic() {
        BroadcastNotifier::new(1).notify(EngineEvent::StrategyHalted {
            wallet_id: WalletId::new("main"),
            strategy: StrategyType::Ml,
            reason: "stopped".to_string(),
        });
    }
}
