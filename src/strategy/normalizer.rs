//! Instrument rules lookup and two-exchange quantity reconciliation.

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::error::{ArbError, GatewayError, Result};
use crate::exchange::{
    call_with_retry, canonical_symbol, GatewayRegistry, InstrumentRules, RetryPolicy, Venue,
};
use crate::utils::decimal::{common_step, is_multiple_of, round_down_to_lot, round_up_to_lot};

/// A total size both exchanges can trade identically, slice by slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconciledQuantity {
    pub quantity: Decimal,
    pub per_part_quantity: Decimal,
    pub parts: u32,
    /// Step every slice is a multiple of on both exchanges
    pub step: Decimal,
}

/// Resolves and caches per-exchange instrument rules.
pub struct QuantityNormalizer {
    registry: GatewayRegistry,
    policy: RetryPolicy,
    cache: DashMap<(Venue, String), InstrumentRules>,
}

impl QuantityNormalizer {
    pub fn new(registry: GatewayRegistry, policy: RetryPolicy) -> Self {
        Self {
            registry,
            policy,
            cache: DashMap::new(),
        }
    }

    /// Trading rules for `symbol` on `venue`.
    ///
    /// Fails with `Validation` when the symbol cannot be parsed or is not
    /// listed on the venue.
    pub async fn normalize(&self, venue: Venue, symbol: &str) -> Result<InstrumentRules> {
        let symbol = canonical_symbol(symbol)
            .ok_or_else(|| ArbError::Validation(format!("unrecognised symbol: {symbol}")))?;
        if let Some(rules) = self.cache.get(&(venue, symbol.clone())) {
            return Ok(*rules);
        }

        let gateway = self
            .registry
            .get(venue)
            .ok_or_else(|| ArbError::Validation(format!("no gateway configured for {venue}")))?;
        let rules = call_with_retry(&self.policy, "get_instrument_rules", || {
            gateway.get_instrument_rules(&symbol)
        })
        .await
        .map_err(|e| match e {
            GatewayError::UnknownSymbol(_) => {
                ArbError::Validation(format!("{symbol} is not listed on {venue}"))
            }
            other => ArbError::exchange(venue, "get_instrument_rules", other),
        })?;

        if rules.qty_step <= Decimal::ZERO || rules.min_qty > rules.max_qty {
            return Err(ArbError::Validation(format!(
                "{venue} reports unusable rules for {symbol}: step {} min {} max {}",
                rules.qty_step, rules.min_qty, rules.max_qty
            )));
        }

        debug!(%venue, %symbol, step = %rules.qty_step, min = %rules.min_qty, "Cached instrument rules");
        self.cache.insert((venue, symbol), rules);
        Ok(rules)
    }

    /// Forget cached rules, e.g. after the exchange changed a step size.
    pub fn invalidate(&self, venue: Venue, symbol: &str) {
        if let Some(symbol) = canonical_symbol(symbol) {
            self.cache.remove(&(venue, symbol));
        }
    }
}

/// Reconcile `requested` into `parts` equal slices tradable on both
/// exchanges.
///
/// Each slice is rounded down to the common step of both exchanges. If the
/// resulting total differs from `requested` or violates either exchange's
/// min/max, the request is rejected with the nearest valid totals instead
/// of being adjusted.
pub fn reconcile_quantity(
    a: &InstrumentRules,
    b: &InstrumentRules,
    requested: Decimal,
    parts: u32,
) -> Result<ReconciledQuantity> {
    if requested <= Decimal::ZERO {
        return Err(ArbError::Validation(format!("quantity must be positive, got {requested}")));
    }
    if parts == 0 {
        return Err(ArbError::Validation("parts must be at least 1".to_string()));
    }

    let n = Decimal::from(parts);
    let step = common_step(a.qty_step, b.qty_step);
    let min_part = a.min_qty.max(b.min_qty);
    let max_part = a.max_qty.min(b.max_qty);
    let lowest_part = round_up_to_lot(min_part, step);
    let highest_part = round_down_to_lot(max_part, step);

    let reject = |reason: String, suggestions: Vec<Decimal>| ArbError::QuantityRejected {
        requested,
        reason,
        suggestions,
    };

    if lowest_part > highest_part {
        return Err(reject(
            format!("no slice size satisfies both exchanges (min {min_part}, max {max_part}, step {step})"),
            Vec::new(),
        ));
    }

    let per_part = round_down_to_lot(requested / n, step);

    if per_part < lowest_part {
        return Err(reject(
            format!("slice size {per_part} is below the minimum {lowest_part}"),
            vec![(lowest_part * n).normalize()],
        ));
    }
    if per_part > highest_part {
        return Err(reject(
            format!("slice size {per_part} is above the maximum {highest_part}"),
            vec![(highest_part * n).normalize()],
        ));
    }

    let total = (per_part * n).normalize();
    if total != requested.normalize() {
        let mut suggestions = vec![total];
        let next = per_part + step;
        if next <= highest_part {
            suggestions.push((next * n).normalize());
        }
        return Err(reject(
            format!("{requested} does not split into {parts} slices of step {step}"),
            suggestions,
        ));
    }

    debug_assert!(is_multiple_of(per_part, a.qty_step) && is_multiple_of(per_part, b.qty_step));
    Ok(ReconciledQuantity {
        quantity: total,
        per_part_quantity: per_part.normalize(),
        parts,
        step,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperGateway;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn rules(min: Decimal, step: Decimal) -> InstrumentRules {
        InstrumentRules {
            min_qty: min,
            max_qty: dec!(100),
            qty_step: step,
            price_precision: 2,
            qty_precision: step.scale(),
        }
    }

    fn suggestions(err: ArbError) -> Vec<Decimal> {
        match err {
            ArbError::QuantityRejected { suggestions, .. } => suggestions,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_exact_split_is_accepted() {
        let q = reconcile_quantity(
            &rules(dec!(0.001), dec!(0.001)),
            &rules(dec!(0.01), dec!(0.01)),
            dec!(1.0),
            5,
        )
        .unwrap();
        assert_eq!(q.per_part_quantity, dec!(0.2));
        assert_eq!(q.quantity, dec!(1));
        assert_eq!(q.step, dec!(0.01));
    }

    #[test]
    fn test_rejects_instead_of_adjusting() {
        let err = reconcile_quantity(
            &rules(dec!(0.001), dec!(0.001)),
            &rules(dec!(0.01), dec!(0.01)),
            dec!(1.003),
            2,
        )
        .unwrap_err();
        assert_eq!(suggestions(err), vec![dec!(1), dec!(1.02)]);
    }

    #[test]
    fn test_incompatible_steps_use_common_multiple() {
        // 0.003 and 0.002 only agree on multiples of 0.006
        let err = reconcile_quantity(
            &rules(dec!(0.003), dec!(0.003)),
            &rules(dec!(0.002), dec!(0.002)),
            dec!(0.01),
            1,
        )
        .unwrap_err();
        assert_eq!(suggestions(err), vec![dec!(0.006), dec!(0.012)]);
    }

    #[test]
    fn test_below_minimum_suggests_smallest_total() {
        let err = reconcile_quantity(
            &rules(dec!(0.1), dec!(0.1)),
            &rules(dec!(0.05), dec!(0.05)),
            dec!(0.3),
            5,
        )
        .unwrap_err();
        assert_eq!(suggestions(err), vec![dec!(0.5)]);
    }

    #[test]
    fn test_bad_inputs_are_validation_errors() {
        let r = rules(dec!(0.1), dec!(0.1));
        assert!(matches!(
            reconcile_quantity(&r, &r, dec!(0), 1),
            Err(ArbError::Validation(_))
        ));
        assert!(matches!(
            reconcile_quantity(&r, &r, dec!(1), 0),
            Err(ArbError::Validation(_))
        ));
    }

    #[test]
    fn test_rounding_never_exceeds_request() {
        let a = rules(dec!(0.001), dec!(0.001));
        let b = rules(dec!(0.005), dec!(0.005));
        for (requested, parts) in [(dec!(0.5), 3u32), (dec!(1.234), 4), (dec!(7), 7), (dec!(0.02), 2)] {
            let (total, per_part) = match reconcile_quantity(&a, &b, requested, parts) {
                Ok(q) => (q.quantity, q.per_part_quantity),
                Err(ArbError::QuantityRejected { suggestions, .. }) => {
                    let total = suggestions[0];
                    (total, total / Decimal::from(parts))
                }
                Err(other) => panic!("unexpected {other:?}"),
            };
            assert!(total <= requested);
            assert!(is_multiple_of(per_part, dec!(0.005)));
        }
    }

    #[tokio::test]
    async fn test_normalize_caches_and_validates() {
        let paper = Arc::new(PaperGateway::new(Venue::Bybit));
        paper.list_symbol("BTC/USDT", rules(dec!(0.001), dec!(0.001))).await;
        let registry = GatewayRegistry::new().with(paper);
        let normalizer = QuantityNormalizer::new(registry, RetryPolicy::default());

        let r = normalizer.normalize(Venue::Bybit, "btcusdt").await.unwrap();
        assert_eq!(r.qty_step, dec!(0.001));

        assert!(matches!(
            normalizer.normalize(Venue::Bybit, "ETH/USDT").await,
            Err(ArbError::Validation(_))
        ));
        assert!(matches!(
            normalizer.normalize(Venue::Mexc, "BTC/USDT").await,
            Err(ArbError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_refetches_rules() {
        let paper = Arc::new(PaperGateway::new(Venue::Bybit));
        paper.list_symbol("BTC/USDT", rules(dec!(0.001), dec!(0.001))).await;
        let registry = GatewayRegistry::new().with(paper.clone());
        let normalizer = QuantityNormalizer::new(registry, RetryPolicy::default());
        normalizer.normalize(Venue::Bybit, "BTC/USDT").await.unwrap();

        // The exchange coarsens its step; the cache still answers
        paper.list_symbol("BTC/USDT", rules(dec!(0.01), dec!(0.01))).await;
        let cached = normalizer.normalize(Venue::Bybit, "BTC/USDT").await.unwrap();
        assert_eq!(cached.qty_step, dec!(0.001));

        normalizer.invalidate(Venue::Bybit, "BTCUSDT");
        let fresh = normalizer.normalize(Venue::Bybit, "BTC/USDT").await.unwrap();
        assert_eq!(fresh.qty_step, dec!(0.01));
    }
}
