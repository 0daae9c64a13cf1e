//! Take-profit / stop-loss rules and the named risk scenarios.

use crate::domain::{Decimal, OrderId, OrderKind, PositionId, Side, TimeMs};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpSlKind {
    TakeProfit,
    StopLoss,
}

impl TpSlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TpSlKind::TakeProfit => "take_profit",
            TpSlKind::StopLoss => "stop_loss",
        }
    }

    pub fn parse(s: &str) -> Option<TpSlKind> {
        match s {
            "take_profit" => Some(TpSlKind::TakeProfit),
            "stop_loss" => Some(TpSlKind::StopLoss),
            _ => None,
        }
    }

    pub fn order_kind(&self) -> OrderKind {
        match self {
            TpSlKind::TakeProfit => OrderKind::TakeProfit,
            TpSlKind::StopLoss => OrderKind::StopLoss,
        }
    }

    /// Whether `price` has crossed `target` for a position on `side`.
    ///
    /// Long TP fires at or above target, short TP at or below; stop-losses
    /// are the mirror image.
    pub fn is_hit(&self, side: Side, target: Decimal, price: Decimal) -> bool {
        match (self, side) {
            (TpSlKind::TakeProfit, Side::Long) | (TpSlKind::StopLoss, Side::Short) => {
                price >= target
            }
            (TpSlKind::TakeProfit, Side::Short) | (TpSlKind::StopLoss, Side::Long) => {
                price <= target
            }
        }
    }
}

impl std::fmt::Display for TpSlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a rule's target was expressed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum TpSlMode {
    AbsolutePrice(Decimal),
    /// Percent distance from entry, always given as a positive magnitude.
    PercentOffset(Decimal),
}

impl TpSlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TpSlMode::AbsolutePrice(_) => "absolute_price",
            TpSlMode::PercentOffset(_) => "percent_offset",
        }
    }

    pub fn value(&self) -> Decimal {
        match self {
            TpSlMode::AbsolutePrice(v) | TpSlMode::PercentOffset(v) => *v,
        }
    }

    pub fn from_parts(mode: &str, value: Decimal) -> Option<TpSlMode> {
        match mode {
            "absolute_price" => Some(TpSlMode::AbsolutePrice(value)),
            "percent_offset" => Some(TpSlMode::PercentOffset(value)),
            _ => None,
        }
    }
}

/// A requested TP or SL, before it is bound to a position's entry price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpSlSpec {
    pub kind: TpSlKind,
    pub mode: TpSlMode,
}

impl TpSlSpec {
    pub fn take_profit_pct(pct: Decimal) -> Self {
        Self {
            kind: TpSlKind::TakeProfit,
            mode: TpSlMode::PercentOffset(pct),
        }
    }

    pub fn stop_loss_pct(pct: Decimal) -> Self {
        Self {
            kind: TpSlKind::StopLoss,
            mode: TpSlMode::PercentOffset(pct),
        }
    }

    pub fn take_profit_at(price: Decimal) -> Self {
        Self {
            kind: TpSlKind::TakeProfit,
            mode: TpSlMode::AbsolutePrice(price),
        }
    }

    pub fn stop_loss_at(price: Decimal) -> Self {
        Self {
            kind: TpSlKind::StopLoss,
            mode: TpSlMode::AbsolutePrice(price),
        }
    }

    /// Resolve to an absolute target price using the position's entry price.
    pub fn resolve_target(&self, side: Side, entry_price: Decimal) -> Decimal {
        match self.mode {
            TpSlMode::AbsolutePrice(price) => price,
            TpSlMode::PercentOffset(pct) => {
                let favourable = matches!(
                    (self.kind, side),
                    (TpSlKind::TakeProfit, Side::Long) | (TpSlKind::StopLoss, Side::Short)
                );
                if favourable {
                    entry_price.offset_pct(pct.abs())
                } else {
                    entry_price.offset_pct(-pct.abs())
                }
            }
        }
    }
}

/// An active TP or SL bound to one position. Targets are always absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpSlRule {
    pub position_id: PositionId,
    pub kind: TpSlKind,
    pub mode: TpSlMode,
    pub target_price: Decimal,
    pub created_at: TimeMs,
    /// Venue order backing this rule.
    pub order_id: Option<OrderId>,
    pub active: bool,
    /// Set while the close caused by this rule is in flight.
    pub triggered: bool,
}

impl TpSlRule {
    pub fn resolve(position_id: PositionId, spec: TpSlSpec, side: Side, entry: Decimal) -> Self {
        Self {
            position_id,
            kind: spec.kind,
            mode: spec.mode,
            target_price: spec.resolve_target(side, entry),
            created_at: TimeMs::now(),
            order_id: None,
            active: true,
            triggered: false,
        }
    }

    pub fn is_hit(&self, side: Side, price: Decimal) -> bool {
        self.kind.is_hit(side, self.target_price, price)
    }
}

/// Named TP/SL presets, expressed in percent of entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskScenario {
    Scalping,
    Conservative,
    Moderate,
    Aggressive,
    Custom { tp_pct: Decimal, sl_pct: Decimal },
}

/// Projected outcome of a scenario for a given entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScenarioProjection {
    pub tp_price: Decimal,
    pub sl_price: Decimal,
    pub tp_pnl: Decimal,
    pub sl_pnl: Decimal,
    /// |tp_pnl / sl_pnl|, zero when the stop breaks even.
    pub risk_reward: Decimal,
    pub notional: Decimal,
}

impl RiskScenario {
    pub fn tp_pct(&self) -> Decimal {
        match self {
            RiskScenario::Scalping => pct("0.3"),
            RiskScenario::Conservative => pct("0.5"),
            RiskScenario::Moderate => pct("1.0"),
            RiskScenario::Aggressive => pct("2.0"),
            RiskScenario::Custom { tp_pct, .. } => *tp_pct,
        }
    }

    pub fn sl_pct(&self) -> Decimal {
        match self {
            RiskScenario::Scalping => pct("0.15"),
            RiskScenario::Conservative => pct("0.3"),
            RiskScenario::Moderate => pct("0.5"),
            RiskScenario::Aggressive => pct("1.0"),
            RiskScenario::Custom { sl_pct, .. } => *sl_pct,
        }
    }

    pub fn specs(&self) -> [TpSlSpec; 2] {
        [
            TpSlSpec::take_profit_pct(self.tp_pct()),
            TpSlSpec::stop_loss_pct(self.sl_pct()),
        ]
    }

    /// Exact TP/SL prices and net P&L (open plus close fee) for an entry.
    pub fn projection(
        &self,
        entry: Decimal,
        size: Decimal,
        side: Side,
        fee_rate: Decimal,
    ) -> ScenarioProjection {
        let [tp, sl] = self.specs();
        let tp_price = tp.resolve_target(side, entry);
        let sl_price = sl.resolve_target(side, entry);
        let notional = size * entry;

        let pnl_at = |exit: Decimal| {
            let move_per_unit = match side {
                Side::Long => exit - entry,
                Side::Short => entry - exit,
            };
            let fees = notional * fee_rate + size * exit * fee_rate;
            move_per_unit * size - fees
        };

        let tp_pnl = pnl_at(tp_price);
        let sl_pnl = pnl_at(sl_price);
        let risk_reward = tp_pnl
            .checked_div(sl_pnl)
            .map(|r| r.abs())
            .unwrap_or_else(Decimal::zero);

        ScenarioProjection {
            tp_price,
            sl_price,
            tp_pnl,
            sl_pnl,
            risk_reward,
            notional,
        }
    }
}

fn pct(s: &str) -> Decimal {
    Decimal::from_str_canonical(s).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_grid_offset_resolves_exactly() {
        let spec = TpSlSpec::take_profit_pct(d("0.03"));
        assert_eq!(spec.resolve_target(Side::Long, d("100.00")), d("100.03"));
        assert_eq!(spec.resolve_target(Side::Short, d("100.00")), d("99.97"));
    }

    #[test]
    fn test_stop_loss_resolves_adverse() {
        let spec = TpSlSpec::stop_loss_pct(d("0.5"));
        assert_eq!(spec.resolve_target(Side::Long, d("200")), d("199"));
        assert_eq!(spec.resolve_target(Side::Short, d("200")), d("201"));
    }

    #[test]
    fn test_absolute_target_ignores_entry() {
        let spec = TpSlSpec::take_profit_at(d("123.45"));
        assert_eq!(spec.resolve_target(Side::Long, d("1")), d("123.45"));
    }

    #[test]
    fn test_trigger_conditions() {
        let target = d("100.03");
        assert!(TpSlKind::TakeProfit.is_hit(Side::Long, target, d("100.05")));
        assert!(TpSlKind::TakeProfit.is_hit(Side::Long, target, d("100.03")));
        assert!(!TpSlKind::TakeProfit.is_hit(Side::Long, target, d("100.02")));

        assert!(TpSlKind::TakeProfit.is_hit(Side::Short, d("99"), d("98.9")));
        assert!(TpSlKind::StopLoss.is_hit(Side::Long, d("99"), d("98.9")));
        assert!(TpSlKind::StopLoss.is_hit(Side::Short, d("101"), d("101.5")));
        assert!(!TpSlKind::StopLoss.is_hit(Side::Short, d("101"), d("100")));
    }

    #[test]
    fn test_scenario_presets() {
        assert_eq!(RiskScenario::Scalping.tp_pct(), d("0.3"));
        assert_eq!(RiskScenario::Scalping.sl_pct(), d("0.15"));
        assert_eq!(RiskScenario::Aggressive.tp_pct(), d("2"));
        let custom = RiskScenario::Custom {
            tp_pct: d("1.5"),
            sl_pct: d("0.7"),
        };
        assert_eq!(custom.specs()[1], TpSlSpec::stop_loss_pct(d("0.7")));
    }

    #[test]
    fn test_projection_without_fees() {
        let projection =
            RiskScenario::Moderate.projection(d("100"), d("2"), Side::Long, Decimal::zero());
        assert_eq!(projection.tp_price, d("101"));
        assert_eq!(projection.sl_price, d("99.5"));
        assert_eq!(projection.tp_pnl, d("2"));
        assert_eq!(projection.sl_pnl, d("-1"));
        assert_eq!(projection.risk_reward, d("2"));
        assert_eq!(projection.notional, d("200"));
    }

    #[test]
    fn test_projection_with_fees_short() {
        let projection =
            RiskScenario::Conservative.projection(d("100"), d("1"), Side::Short, d("0.0001"));
        // TP at 99.5: gain 0.5 minus fees 0.01 + 0.00995
        assert_eq!(projection.tp_price, d("99.5"));
        assert_eq!(projection.tp_pnl, d("0.48005"));
    }

    #[test]
    fn test_rule_resolve_binds_target() {
        let rule = TpSlRule::resolve(
            PositionId::new(),
            TpSlSpec::take_profit_pct(d("0.03")),
            Side::Long,
            d("100.00"),
        );
        assert_eq!(rule.target_price, d("100.03"));
        assert!(rule.active);
        assert!(!rule.triggered);
        assert!(rule.is_hit(Side::Long, d("100.05")));
    }
}
