// ===============================
// src/calc.rs
// ===============================
//
// Pricing / sizing helpers. Pure, no I/O.
//

use crate::domain::Side;

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLevel {
    /// 1-based, matches the `-so-{n}` link suffix.
    pub index: usize,
    pub price: f64,
    pub qty: f64,
    pub cum_percent: f64,
}

pub fn avg_price(total_cost: f64, total_qty: f64) -> f64 {
    if total_qty == 0.0 { 0.0 } else { total_cost / total_qty }
}

pub fn tp_price(avg: f64, tp_percent: f64, side: Side) -> f64 {
    match side {
        Side::Buy => avg * (1.0 + tp_percent / 100.0),
        Side::Sell => avg * (1.0 - tp_percent / 100.0),
    }
}

/// Floor to a multiple of `step`. The epsilon keeps 0.3/0.1 style values
/// from dropping a whole step; the result is trimmed to the step's decimals.
pub fn round_down(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let n = (value / step + EPS).floor();
    let factor = 10f64.powi(step_decimals(step) as i32);
    ((n * step) * factor).round() / factor
}

/// Number of decimals needed to print `step` exactly (capped at 12).
pub fn step_decimals(step: f64) -> usize {
    let mut d = 0usize;
    let mut s = step;
    while d < 12 && (s - s.round()).abs() > EPS {
        s *= 10.0;
        d += 1;
    }
    d
}

pub fn safety_grid(
    entry_price: f64,
    count: usize,
    step_percent: f64,
    step_multiplier: f64,
    base_qty: f64,
    qty_multiplier: f64,
    side: Side,
) -> Vec<GridLevel> {
    let mut out = Vec::with_capacity(count);
    let mut cum = 0.0;
    for i in 0..count {
        cum += step_percent * step_multiplier.powi(i as i32);
        let qty = base_qty * qty_multiplier.powi(i as i32);
        let price = match side {
            Side::Buy => entry_price * (1.0 - cum / 100.0),
            Side::Sell => entry_price * (1.0 + cum / 100.0),
        };
        out.push(GridLevel { index: i + 1, price, qty, cum_percent: cum });
    }
    out
}

/// Position is flat when at or below half a lot.
pub fn is_qty_zero(qty: f64, lot_size: f64) -> bool {
    let tol = if lot_size > 0.0 { lot_size / 2.0 } else { EPS };
    qty.abs() <= tol
}
