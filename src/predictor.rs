//! Direction predictors consumed by the ML signal strategy.
//!
//! The engine treats a predictor as a possibly slow, possibly failing black
//! box. [`TrendPredictor`] is the indicator heuristic used when no trained
//! model is wired in.

use crate::domain::{Decimal, Side};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Sideways,
}

impl Direction {
    /// Position side implied by the direction; None for sideways.
    pub fn side(&self) -> Option<Side> {
        match self {
            Direction::Up => Some(Side::Long),
            Direction::Down => Some(Side::Short),
            Direction::Sideways => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub direction: Direction,
    /// In [0, 1].
    pub confidence: Decimal,
}

impl Prediction {
    pub fn sideways(confidence: Decimal) -> Self {
        Self {
            direction: Direction::Sideways,
            confidence,
        }
    }
}

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("Not enough history: {have} < {need}")]
    NotEnoughHistory { have: usize, need: usize },

    #[error("Predictor failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Predictor: Send + Sync + std::fmt::Debug {
    /// Predict the next move from prices ordered oldest first.
    async fn predict(&self, history: &[Decimal]) -> Result<Prediction, PredictorError>;
}

const MIN_HISTORY: usize = 20;
const RSI_PERIOD: usize = 14;

/// MA5/MA20 crossover gated by RSI(14) and the 5-bar trend.
#[derive(Debug, Clone, Default)]
pub struct TrendPredictor;

impl TrendPredictor {
    pub fn new() -> Self {
        Self
    }

    fn evaluate(prices: &[f64]) -> (Direction, f64) {
        if prices.len() < MIN_HISTORY {
            return (Direction::Sideways, 0.5);
        }
        let window = &prices[prices.len() - MIN_HISTORY..];
        let last = window[window.len() - 1];
        let five_back = window[window.len() - 5];

        let ma5 = mean(&window[window.len() - 5..]);
        let ma20 = mean(window);
        let rsi = rsi(window, RSI_PERIOD);
        let short_trend = if five_back == 0.0 {
            0.0
        } else {
            (last - five_back) / five_back
        };
        let confidence = (0.5 + short_trend.abs() * 10.0).min(0.8);

        if ma5 > ma20 && rsi < 70.0 && short_trend > 0.0 {
            (Direction::Up, confidence)
        } else if ma5 < ma20 && rsi > 30.0 && short_trend < 0.0 {
            (Direction::Down, confidence)
        } else {
            (Direction::Sideways, 0.6)
        }
    }
}

#[async_trait]
impl Predictor for TrendPredictor {
    async fn predict(&self, history: &[Decimal]) -> Result<Prediction, PredictorError> {
        if history.len() < MIN_HISTORY {
            return Err(PredictorError::NotEnoughHistory {
                have: history.len(),
                need: MIN_HISTORY,
            });
        }
        let prices: Vec<f64> = history.iter().map(Decimal::to_f64_lossy).collect();
        let (direction, confidence) = Self::evaluate(&prices);
        let confidence = Decimal::from_f64_lossy(confidence)
            .ok_or_else(|| PredictorError::Failed("confidence is not finite".to_string()))?;
        Ok(Prediction {
            direction,
            confidence,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Simple-average RSI over the last `period` deltas.
fn rsi(prices: &[f64], period: usize) -> f64 {
    if prices.len() < period + 1 {
        return 50.0;
    }
    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let recent = &deltas[deltas.len() - period..];
    let avg_gain = mean(&recent.iter().map(|d| d.max(0.0)).collect::<Vec<_>>());
    let avg_loss = mean(&recent.iter().map(|d| (-d).max(0.0)).collect::<Vec<_>>());
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Vec<Decimal> {
        values
            .iter()
            .map(|v| Decimal::from_f64_lossy(*v).unwrap())
            .collect()
    }

    /// Alternating +3 / -2 bars: a steady climb with RSI around 60.
    fn choppy_uptrend() -> Vec<f64> {
        let mut price = 100.0;
        let mut out = Vec::new();
        for i in 0..30 {
            price += if i % 2 == 0 { 3.0 } else { -2.0 };
            out.push(price);
        }
        out
    }

    #[tokio::test]
    async fn test_short_history_is_an_error() {
        let err = TrendPredictor::new()
            .predict(&series(&[1.0, 2.0, 3.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, PredictorError::NotEnoughHistory { have: 3, need: 20 }));
    }

    #[tokio::test]
    async fn test_flat_prices_are_sideways() {
        let prediction = TrendPredictor::new()
            .predict(&series(&[100.0; 25]))
            .await
            .unwrap();
        assert_eq!(prediction.direction, Direction::Sideways);
        assert_eq!(prediction.confidence, Decimal::from_f64_lossy(0.6).unwrap());
    }

    #[test]
    fn test_choppy_uptrend_is_up() {
        let (direction, confidence) = TrendPredictor::evaluate(&choppy_uptrend());
        assert_eq!(direction, Direction::Up);
        assert!(confidence > 0.5 && confidence <= 0.8);
    }

    #[test]
    fn test_choppy_downtrend_is_down() {
        let prices: Vec<f64> = choppy_uptrend().iter().map(|p| 300.0 - p).collect();
        let (direction, _) = TrendPredictor::evaluate(&prices);
        assert_eq!(direction, Direction::Down);
    }

    #[test]
    fn test_monotonic_rise_is_overbought() {
        // every delta positive: RSI 100 blocks the long signal
        let prices: Vec<f64> = (0..25).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&prices, RSI_PERIOD), 100.0);
        assert_eq!(TrendPredictor::evaluate(&prices).0, Direction::Sideways);
    }

    #[test]
    fn test_direction_side() {
        assert_eq!(Direction::Up.side(), Some(Side::Long));
        assert_eq!(Direction::Down.side(), Some(Side::Short));
        assert_eq!(Direction::Sideways.side(), None);
    }
}
