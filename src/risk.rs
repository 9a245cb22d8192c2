// ===============================
// src/risk.rs
// ===============================
//
// Capital allocation for one buy phase:
// - spend at most `spend_limit` x cash in total
// - split equally or proportionally to each entry's weight
// - drop slices smaller than `min_fraction` x cash
// - floor to whole shares at the observed price
//
use thiserror::Error;
use tracing::debug;

use crate::metrics::ALLOC_REJECTS;
use crate::runner::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    Equal,
    Weighted,
}

#[derive(Debug, Clone)]
pub struct AllocationRule {
    pub mode: AllocationMode,
    pub spend_limit: f64,
    pub min_fraction: f64,
}

impl Default for AllocationRule {
    fn default() -> Self {
        Self { mode: AllocationMode::Equal, spend_limit: 0.9, min_fraction: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub symbol: String,
    pub price: f64,
    pub budget: f64,
    pub qty: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("price {0} is not usable")]
    BadPrice(f64),
    #[error("budget {budget:.2} below minimum {floor:.2}")]
    BelowMinimum { budget: f64, floor: f64 },
    #[error("budget {budget:.2} buys no whole share at {price:.4}")]
    ZeroQuantity { budget: f64, price: f64 },
}

/// Whole shares affordable with `budget` at `price`.
pub fn shares_for(budget: f64, price: f64) -> Result<u64, RiskError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(RiskError::BadPrice(price));
    }
    let qty = (budget.max(0.0) / price).floor();
    if qty < 1.0 {
        return Err(RiskError::ZeroQuantity { budget, price });
    }
    Ok(qty as u64)
}

fn budgets(entries: &[Entry], total: f64, mode: AllocationMode) -> Vec<f64> {
    let n = entries.len() as f64;
    let weight_sum: f64 = entries.iter().map(|e| e.weight).filter(|w| w.is_finite() && *w > 0.0).sum();
    match mode {
        AllocationMode::Weighted if weight_sum > 0.0 => entries
            .iter()
            .map(|e| if e.weight.is_finite() && e.weight > 0.0 { total * e.weight / weight_sum } else { 0.0 })
            .collect(),
        _ => vec![total / n; entries.len()],
    }
}

/// Sizes every entry. Entries that end up too small are dropped, never resized.
pub fn allocate(entries: &[Entry], cash: f64, rule: &AllocationRule) -> Vec<Allocation> {
    if entries.is_empty() || !cash.is_finite() || cash <= 0.0 {
        return Vec::new();
    }
    let total = cash * rule.spend_limit.clamp(0.0, 1.0);
    let floor = cash * rule.min_fraction.max(0.0);

    entries
        .iter()
        .zip(budgets(entries, total, rule.mode))
        .filter_map(|(e, budget)| {
            let sized = if budget < floor {
                Err(RiskError::BelowMinimum { budget, floor })
            } else {
                shares_for(budget, e.price)
            };
            match sized {
                Ok(qty) => Some(Allocation { symbol: e.symbol.clone(), price: e.price, budget, qty }),
                Err(err) => {
                    ALLOC_REJECTS.inc();
                    debug!(symbol = %e.symbol, %err, "entry dropped by allocation");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn entry(symbol: &str, price: f64, weight: f64) -> Entry {
        Entry { symbol: symbol.into(), price, weight }
    }

    #[test]
    fn equal_split_respects_spend_limit() {
        let entries = vec![entry("A", 10.0, 1.0), entry("B", 10.0, 1.0), entry("C", 10.0, 1.0)];
        let rule = AllocationRule { mode: AllocationMode::Equal, spend_limit: 0.9, min_fraction: 0.0 };
        let allocs = allocate(&entries, 900.0, &rule);
        assert_eq!(allocs.len(), 3);
        for a in &allocs {
            assert_relative_eq!(a.budget, 270.0, epsilon = 1e-9);
            assert_eq!(a.qty, 27);
        }
        let spent: f64 = allocs.iter().map(|a| a.qty as f64 * a.price).sum();
        assert!(spent <= 810.0 + 1e-9);
    }

    #[test]
    fn weighted_split_follows_weights() {
        let entries = vec![entry("A", 1.0, 3.0), entry("B", 1.0, 1.0), entry("C", 1.0, f64::NAN)];
        let rule = AllocationRule { mode: AllocationMode::Weighted, spend_limit: 1.0, min_fraction: 0.0 };
        let allocs = allocate(&entries, 400.0, &rule);
        let by: Vec<(&str, u64)> = allocs.iter().map(|a| (a.symbol.as_str(), a.qty)).collect();
        assert_eq!(by, vec![("A", 300), ("B", 100)]);
    }

    #[test]
    fn small_and_unaffordable_slices_are_dropped() {
        let entries = vec![entry("A", 500.0, 1.0), entry("B", 5.0, 1.0), entry("C", 0.0, 1.0)];
        let rule = AllocationRule { mode: AllocationMode::Equal, spend_limit: 0.9, min_fraction: 0.0 };
        let allocs = allocate(&entries, 1_000.0, &rule);
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].symbol, "B");
        assert_eq!(allocs[0].qty, 60);

        let rule = AllocationRule { min_fraction: 0.5, ..rule };
        assert!(allocate(&entries, 1_000.0, &rule).is_empty());
    }

    #[test]
    fn share_sizing_floors() {
        assert_eq!(shares_for(99.9, 10.0), Ok(9));
        assert_eq!(shares_for(9.0, 10.0), Err(RiskError::ZeroQuantity { budget: 9.0, price: 10.0 }));
        assert_eq!(shares_for(10.0, f64::INFINITY), Err(RiskError::BadPrice(f64::INFINITY)));
    }
}
