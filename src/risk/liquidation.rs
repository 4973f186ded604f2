//! Liquidation proximity of leveraged legs.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// How far the mark has travelled from entry towards liquidation.
///
/// 0 at (or beyond, in the favourable direction) the entry price, 1 at the
/// liquidation price. Undefined inputs yield 0.
pub fn liquidation_proximity(entry: Decimal, mark: Decimal, liquidation: Decimal) -> Decimal {
    if entry <= Decimal::ZERO || mark <= Decimal::ZERO || liquidation <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let room = (entry - liquidation).abs();
    if room.is_zero() {
        return Decimal::ONE;
    }

    let left = (mark - liquidation).abs();
    // Mark already past liquidation
    let past = (entry > liquidation && mark <= liquidation) || (entry < liquidation && mark >= liquidation);
    if past {
        return Decimal::ONE;
    }
    (Decimal::ONE - left / room)
        .max(Decimal::ZERO)
        .min(Decimal::ONE)
        .round_dp(6)
}

/// Distance from mark to liquidation as a percentage of mark.
pub fn liquidation_distance_pct(mark: Decimal, liquidation: Decimal) -> Option<Decimal> {
    if mark.is_zero() || liquidation.is_zero() {
        return None;
    }
    Some((((mark - liquidation) / mark).abs() * dec!(100)).round_dp(4))
}
