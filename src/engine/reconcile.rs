//! Deterministic comparison of local positions against venue truth.

use crate::domain::{Decimal, Position, PositionId, PositionState, ProductId};
use crate::venue::VenuePosition;
use std::collections::BTreeMap;

/// What reconciliation needs to know about one local position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedPosition {
    pub id: PositionId,
    pub product_id: ProductId,
    pub state: PositionState,
    pub signed_size: Decimal,
}

impl TrackedPosition {
    pub fn from_position(position: &Position) -> Self {
        Self {
            id: position.id,
            product_id: position.product_id,
            state: position.state,
            signed_size: position.signed_size(),
        }
    }

    /// An entry or exit is still in flight; the venue may legitimately differ.
    fn in_flight(&self) -> bool {
        matches!(
            self.state,
            PositionState::PendingEntry | PositionState::PendingExit
        )
    }
}

/// Net exposure disagreement on one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub product_id: ProductId,
    pub local_size: Decimal,
    pub venue_size: Decimal,
    /// Open positions on the product; empty when the venue holds exposure
    /// nothing local explains.
    pub positions: Vec<PositionId>,
}

/// Compare per-product net exposure.
///
/// Terminal positions are ignored. Products with an entry or exit in flight
/// are skipped. Output is sorted by product id, so the same inputs always
/// produce the same verdict.
pub fn compare(
    local: &[TrackedPosition],
    venue: &[VenuePosition],
    tolerance: Decimal,
) -> Vec<Mismatch> {
    #[derive(Default)]
    struct Net {
        local: Decimal,
        venue: Decimal,
        positions: Vec<PositionId>,
        in_flight: bool,
    }

    let mut by_product: BTreeMap<ProductId, Net> = BTreeMap::new();
    for position in local.iter().filter(|p| !p.state.is_terminal()) {
        let entry = by_product.entry(position.product_id).or_default();
        entry.in_flight |= position.in_flight();
        entry.positions.push(position.id);
        if position.state.holds_exposure() {
            entry.local += position.signed_size;
        }
    }
    for position in venue {
        by_product.entry(position.product_id).or_default().venue += position.signed_size;
    }

    by_product
        .into_iter()
        .filter(|(_, net)| !net.in_flight)
        .filter(|(_, net)| (net.local - net.venue).abs() > tolerance)
        .map(|(product_id, net)| {
            let mut positions = net.positions;
            positions.sort();
            Mismatch {
                product_id,
                local_size: net.local,
                venue_size: net.venue,
                positions,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn tracked(product: u32, state: PositionState, signed: &str) -> TrackedPosition {
        TrackedPosition {
            id: PositionId::new(),
            product_id: ProductId::new(product),
            state,
            signed_size: d(signed),
        }
    }

    fn venue(product: u32, signed: &str) -> VenuePosition {
        VenuePosition {
            product_id: ProductId::new(product),
            signed_size: d(signed),
            entry_price: None,
        }
    }

    #[test]
    fn test_matching_sizes_within_tolerance() {
        let local = vec![tracked(2, PositionState::Open, "0.1")];
        let remote = vec![venue(2, "0.100000001")];
        assert!(compare(&local, &remote, d("0.00000001")).is_empty());
    }

    #[test]
    fn test_size_gap_is_a_mismatch() {
        let local = vec![tracked(2, PositionState::Open, "-0.1")];
        let remote = vec![venue(2, "-0.05")];
        let mismatches = compare(&local, &remote, d("0.00000001"));
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].local_size, d("-0.1"));
        assert_eq!(mismatches[0].venue_size, d("-0.05"));
        assert_eq!(mismatches[0].positions, vec![local[0].id]);
    }

    #[test]
    fn test_venue_flat_while_local_open() {
        let local = vec![tracked(4, PositionState::Open, "1")];
        let mismatches = compare(&local, &[], Decimal::zero());
        assert_eq!(mismatches[0].venue_size, Decimal::zero());
    }

    #[test]
    fn test_untracked_venue_exposure_has_no_positions() {
        let mismatches = compare(&[], &[venue(8, "3")], Decimal::zero());
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].positions.is_empty());
    }

    #[test]
    fn test_in_flight_products_are_skipped() {
        let local = vec![
            tracked(2, PositionState::Open, "0.1"),
            tracked(2, PositionState::PendingEntry, "0"),
        ];
        assert!(compare(&local, &[venue(2, "0.3")], Decimal::zero()).is_empty());
    }

    #[test]
    fn test_net_of_several_positions() {
        let local = vec![
            tracked(2, PositionState::Open, "0.1"),
            tracked(2, PositionState::Open, "-0.04"),
            tracked(2, PositionState::Closed, "0"),
        ];
        assert!(compare(&local, &[venue(2, "0.06")], Decimal::zero()).is_empty());
    }

    #[test]
    fn test_output_is_sorted_by_product() {
        let local = vec![
            tracked(8, PositionState::Open, "1"),
            tracked(2, PositionState::Open, "1"),
        ];
        let products: Vec<u32> = compare(&local, &[], Decimal::zero())
            .iter()
            .map(|m| m.product_id.as_u32())
            .collect();
        assert_eq!(products, vec![2, 8]);
    }
}
