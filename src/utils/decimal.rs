//! Decimal arithmetic utilities for order sizing and PnL.

use rust_decimal::Decimal;

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    ((value / lot_size).floor() * lot_size).normalize()
}

/// Round up to lot size.
pub fn round_up_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    ((value / lot_size).ceil() * lot_size).normalize()
}

/// Whether `value` is an exact multiple of `step`.
pub fn is_multiple_of(value: Decimal, step: Decimal) -> bool {
    if step <= Decimal::ZERO {
        return true;
    }
    (value % step).is_zero()
}

/// Smallest step that is a multiple of both `a` and `b`.
///
/// Both steps are scaled to integers at their common precision, then the
/// integer LCM is scaled back. Falls back to the larger step if the scaled
/// values do not fit.
pub fn common_step(a: Decimal, b: Decimal) -> Decimal {
    if a <= Decimal::ZERO {
        return b;
    }
    if b <= Decimal::ZERO {
        return a;
    }

    let scale = a.scale().max(b.scale());
    let factor = Decimal::from_i128_with_scale(10_i128.pow(scale), 0);
    let (ia, ib) = match ((a * factor).trunc().mantissa(), (b * factor).trunc().mantissa()) {
        (x, y) if x > 0 && y > 0 => (x as u128, y as u128),
        _ => return a.max(b),
    };

    let lcm = ia / gcd(ia, ib) * ib;
    match i128::try_from(lcm) {
        Ok(v) if v <= i64::MAX as i128 => (Decimal::from_i128_with_scale(v, 0) / factor).normalize(),
        _ => a.max(b),
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}
