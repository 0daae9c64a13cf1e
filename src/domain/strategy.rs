//! Strategy configuration and persisted strategy instance records.

use crate::domain::{Decimal, PositionId, ProductId, RiskScenario, Side, TimeMs, WalletId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    Grid,
    Ml,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Grid => "grid",
            StrategyType::Ml => "ml",
        }
    }

    pub fn parse(s: &str) -> Option<StrategyType> {
        match s {
            "grid" => Some(StrategyType::Grid),
            "ml" => Some(StrategyType::Ml),
            _ => None,
        }
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Continuous re-entry with a fixed take-profit offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    pub product_id: ProductId,
    pub side: Side,
    pub size: Decimal,
    pub leverage: u32,
    /// Take-profit distance from entry, in percent (0.03 means +0.03%).
    pub tp_offset_pct: Decimal,
    /// Optional protective stop distance from entry, in percent.
    #[serde(default)]
    pub sl_offset_pct: Option<Decimal>,
    pub poll_interval_ms: u64,
}

/// Predictor-driven entries with scenario-based exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlConfig {
    pub product_id: ProductId,
    pub size: Decimal,
    pub leverage: u32,
    /// Minimum predictor confidence in [0, 1] required to act.
    pub min_confidence: Decimal,
    pub scenario: RiskScenario,
    /// Number of prices handed to the predictor.
    pub history_window: usize,
    pub poll_interval_ms: u64,
    pub predictor_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StrategyConfig {
    Grid(GridConfig),
    Ml(MlConfig),
}

impl StrategyConfig {
    pub fn strategy_type(&self) -> StrategyType {
        match self {
            StrategyConfig::Grid(_) => StrategyType::Grid,
            StrategyConfig::Ml(_) => StrategyType::Ml,
        }
    }

    pub fn product_id(&self) -> ProductId {
        match self {
            StrategyConfig::Grid(c) => c.product_id,
            StrategyConfig::Ml(c) => c.product_id,
        }
    }

    pub fn poll_interval_ms(&self) -> u64 {
        match self {
            StrategyConfig::Grid(c) => c.poll_interval_ms,
            StrategyConfig::Ml(c) => c.poll_interval_ms,
        }
    }
}

/// Persisted state of one strategy instance for a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub wallet_id: WalletId,
    pub strategy_type: StrategyType,
    pub config: StrategyConfig,
    pub running: bool,
    pub current_position_id: Option<PositionId>,
    pub updated_at: TimeMs,
    pub halt_reason: Option<String>,
}

impl StrategyRecord {
    pub fn new(wallet_id: WalletId, config: StrategyConfig) -> Self {
        Self {
            wallet_id,
            strategy_type: config.strategy_type(),
            config,
            running: true,
            current_position_id: None,
            updated_at: TimeMs::now(),
            halt_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_is_tagged() {
        let json = serde_json::json!({
            "type": "grid",
            "product_id": 2,
            "side": "long",
            "size": "0.1",
            "leverage": 5,
            "tp_offset_pct": "0.03",
            "poll_interval_ms": 3000
        });
        let config: StrategyConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.strategy_type(), StrategyType::Grid);
        assert_eq!(config.product_id(), ProductId::new(2));
        match config {
            StrategyConfig::Grid(grid) => assert_eq!(grid.sl_offset_pct, None),
            StrategyConfig::Ml(_) => panic!("expected grid config"),
        }
    }

    #[test]
    fn test_ml_config_with_scenario() {
        let json = serde_json::json!({
            "type": "ml",
            "product_id": 8,
            "size": "0.5",
            "leverage": 10,
            "min_confidence": "0.7",
            "scenario": "moderate",
            "history_window": 168,
            "poll_interval_ms": 60000,
            "predictor_timeout_ms": 5000
        });
        let config: StrategyConfig = serde_json::from_value(json).unwrap();
        match config {
            StrategyConfig::Ml(ml) => assert_eq!(ml.scenario, RiskScenario::Moderate),
            StrategyConfig::Grid(_) => panic!("expected ml config"),
        }
    }

    #[test]
    fn test_strategy_type_parse() {
        assert_eq!(StrategyType::parse("grid"), Some(StrategyType::Grid));
        assert_eq!(StrategyType::parse("ml"), Some(StrategyType::Ml));
        assert_eq!(StrategyType::parse("dca"), None);
    }
}
