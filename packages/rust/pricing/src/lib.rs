//! Pricing computation for matched requirements.
//!
//! Pure and deterministic: no I/O, no clock, no randomness. The pipeline
//! hands this crate the candidates accumulated during matching and persists
//! the returned breakdown verbatim.

use serde::{Deserialize, Serialize};
use tenderflow_shared::LineItem;

/// Unit price assumed for a candidate that carries none.
pub const DEFAULT_UNIT_PRICE: f64 = 100.0;

/// Quantity assumed for a candidate that carries none.
pub const DEFAULT_QUANTITY: u32 = 1;

/// A matched catalog candidate awaiting pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceCandidate {
    /// Catalog SKU code.
    pub code: String,
    /// Base unit price from the catalog, if known.
    pub unit_price: Option<f64>,
    /// Quantity carried over from the requirement, if known.
    pub quantity: Option<u32>,
}

/// Line items plus totals for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingBreakdown {
    /// Priced lines, in candidate order. Duplicate codes stay separate
    /// lines; multiplicity from matching is preserved.
    pub line_items: Vec<LineItem>,
    /// Sum of line amounts before margin.
    pub total_base: f64,
    /// Margin amount added on top of the base total.
    pub margin: f64,
    /// Margin-adjusted grand total.
    pub total: f64,
    /// Margin percentage that was applied.
    pub margin_percent: f64,
}

impl PricingBreakdown {
    /// An empty breakdown with zero totals.
    pub fn empty(margin_percent: f64) -> Self {
        Self {
            line_items: Vec::new(),
            total_base: 0.0,
            margin: 0.0,
            total: 0.0,
            margin_percent,
        }
    }
}

/// Compute line items and the margin-adjusted total for one run.
///
/// Total over its input: a missing unit price falls back to
/// [`DEFAULT_UNIT_PRICE`], a missing quantity to [`DEFAULT_QUANTITY`], and
/// an empty candidate list yields an empty breakdown with zero totals.
/// All monetary values are rounded to cents.
pub fn compute_pricing(candidates: &[PriceCandidate], margin_percent: f64) -> PricingBreakdown {
    let mut line_items = Vec::with_capacity(candidates.len());
    let mut total_base = 0.0;

    for candidate in candidates {
        let unit_price = candidate.unit_price.unwrap_or(DEFAULT_UNIT_PRICE);
        let quantity = candidate.quantity.unwrap_or(DEFAULT_QUANTITY);
        let amount = round_cents(unit_price * f64::from(quantity));
        total_base += amount;

        line_items.push(LineItem {
            code: candidate.code.clone(),
            quantity,
            amount,
        });
    }

    let total_base = round_cents(total_base);
    let margin = round_cents(total_base * margin_percent / 100.0);
    let total = round_cents(total_base + margin);

    PricingBreakdown {
        line_items,
        total_base,
        margin,
        total,
        margin_percent,
    }
}

/// Round a monetary amount to cents.
fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(code: &str, unit_price: f64, quantity: u32) -> PriceCandidate {
        PriceCandidate {
            code: code.into(),
            unit_price: Some(unit_price),
            quantity: Some(quantity),
        }
    }

    #[test]
    fn computes_margin_adjusted_total() {
        let breakdown = compute_pricing(
            &[candidate("A", 100.0, 2), candidate("B", 50.0, 1)],
            10.0,
        );

        assert_eq!(breakdown.line_items.len(), 2);
        assert_eq!(breakdown.line_items[0].amount, 200.0);
        assert_eq!(breakdown.line_items[1].amount, 50.0);
        assert_eq!(breakdown.total_base, 250.0);
        assert_eq!(breakdown.margin, 25.0);
        assert_eq!(breakdown.total, 275.0);
    }

    #[test]
    fn empty_input_yields_zero_totals() {
        let breakdown = compute_pricing(&[], 10.0);
        assert!(breakdown.line_items.is_empty());
        assert_eq!(breakdown.total_base, 0.0);
        assert_eq!(breakdown.margin, 0.0);
        assert_eq!(breakdown.total, 0.0);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let breakdown = compute_pricing(
            &[PriceCandidate {
                code: "UNKNOWN".into(),
                unit_price: None,
                quantity: None,
            }],
            10.0,
        );

        assert_eq!(breakdown.line_items[0].quantity, DEFAULT_QUANTITY);
        assert_eq!(breakdown.line_items[0].amount, DEFAULT_UNIT_PRICE);
        assert_eq!(breakdown.total, 110.0);
    }

    #[test]
    fn amounts_round_to_cents() {
        let breakdown = compute_pricing(&[candidate("C", 19.99, 3)], 10.0);
        assert_eq!(breakdown.line_items[0].amount, 59.97);
        assert_eq!(breakdown.total_base, 59.97);
        assert_eq!(breakdown.margin, 6.0);
        assert_eq!(breakdown.total, 65.97);
    }

    #[test]
    fn duplicate_codes_stay_separate_lines() {
        let breakdown = compute_pricing(
            &[candidate("LAPTOP123", 45000.0, 1), candidate("LAPTOP123", 45000.0, 2)],
            10.0,
        );

        assert_eq!(breakdown.line_items.len(), 2);
        assert_eq!(breakdown.total_base, 135000.0);
    }

    #[test]
    fn zero_margin_keeps_base_total() {
        let breakdown = compute_pricing(&[candidate("A", 80.0, 1)], 0.0);
        assert_eq!(breakdown.margin, 0.0);
        assert_eq!(breakdown.total, 80.0);
    }
}
