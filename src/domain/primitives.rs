//! Domain primitives: TimeMs, WalletId, ProductId, Side.

use serde::{Deserialize, Serialize};

/// Time in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeMs(pub i64);

impl TimeMs {
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        TimeMs(chrono::Utc::now().timestamp_millis())
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed between `self` and `later`, saturating at zero.
    pub fn elapsed_until(&self, later: TimeMs) -> i64 {
        later.0.saturating_sub(self.0).max(0)
    }
}

/// Identifies one funded wallet (the configuration label, e.g. "main").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalletId(pub String);

impl WalletId {
    pub fn new(id: impl Into<String>) -> Self {
        WalletId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WalletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Venue product identifier (perpetual market).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(pub u32);

impl ProductId {
    pub fn new(id: u32) -> Self {
        ProductId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Human readable symbol for the products the venue lists by default.
    pub fn symbol(&self) -> Option<&'static str> {
        match self.0 {
            2 => Some("BTC-PERP"),
            4 => Some("ETH-PERP"),
            8 => Some("SOL-PERP"),
            20 => Some("INK-PERP"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.symbol() {
            Some(symbol) => write!(f, "{}", symbol),
            None => write!(f, "product-{}", self.0),
        }
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Signed multiplier for this side (+1 long, -1 short).
    pub fn sign(&self) -> i64 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_sign_and_opposite() {
        assert_eq!(Side::Long.sign(), 1);
        assert_eq!(Side::Short.sign(), -1);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn test_side_serialization() {
        let json = serde_json::to_string(&Side::Long).unwrap();
        assert_eq!(json, "\"long\"");
        assert_eq!(Side::parse("short"), Some(Side::Short));
        assert_eq!(Side::parse("sell"), None);
    }

    #[test]
    fn test_product_display() {
        assert_eq!(ProductId::new(8).to_string(), "SOL-PERP");
        assert_eq!(ProductId::new(99).to_string(), "product-99");
    }

    #[test]
    fn test_elapsed_saturates() {
        let t = TimeMs::new(1000);
        assert_eq!(t.elapsed_until(TimeMs::new(1500)), 500);
        assert_eq!(t.elapsed_until(TimeMs::new(500)), 0);
    }
}
