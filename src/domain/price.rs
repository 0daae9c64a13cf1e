//! Immutable price observations.

use crate::domain::{Decimal, ProductId, TimeMs};
use serde::{Deserialize, Serialize};

/// One observation of a product's prices. Never mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub product_id: ProductId,
    pub mid: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub mark: Decimal,
    pub observed_at: TimeMs,
}

impl PriceSnapshot {
    pub fn new(
        product_id: ProductId,
        bid: Decimal,
        ask: Decimal,
        mark: Decimal,
        observed_at: TimeMs,
    ) -> Self {
        Self {
            product_id,
            mid: (bid + ask) / Decimal::from_i64(2),
            bid,
            ask,
            mark,
            observed_at,
        }
    }

    /// Snapshot where bid, ask, mid and mark all equal `price`.
    pub fn flat(product_id: ProductId, price: Decimal, observed_at: TimeMs) -> Self {
        Self {
            product_id,
            mid: price,
            bid: price,
            ask: price,
            mark: price,
            observed_at,
        }
    }

    /// Price used for TP/SL evaluation.
    pub fn trigger_price(&self) -> Decimal {
        self.mark
    }

    pub fn age_ms(&self, now: TimeMs) -> i64 {
        self.observed_at.elapsed_until(now)
    }

    pub fn is_stale(&self, max_age_ms: i64, now: TimeMs) -> bool {
        self.age_ms(now) > max_age_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_mid_is_average_of_bid_ask() {
        let snapshot = PriceSnapshot::new(
            ProductId::new(2),
            d("99.9"),
            d("100.1"),
            d("100.02"),
            TimeMs::new(0),
        );
        assert_eq!(snapshot.mid, d("100"));
        assert_eq!(snapshot.trigger_price(), d("100.02"));
    }

    #[test]
    fn test_staleness() {
        let snapshot = PriceSnapshot::flat(ProductId::new(2), d("1"), TimeMs::new(1_000));
        assert!(!snapshot.is_stale(500, TimeMs::new(1_500)));
        assert!(snapshot.is_stale(500, TimeMs::new(1_501)));
    }
}
