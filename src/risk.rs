// ===============================
// src/risk.rs
// ===============================
use thiserror::Error;

use crate::domain::{InstrumentRules, Order, OrderType, QtyUnit};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskError {
    #[error("qty {qty} below min qty {min}")]
    MinQty { qty: f64, min: f64 },
    #[error("notional {notional} below min notional {min}")]
    MinNotional { notional: f64, min: f64 },
    #[error("price unknown, cannot check min notional")]
    NoPrice,
}

/// Pre-trade min-qty check, base-denominated sizes only.
pub fn check_min_qty(qty: f64, rules: &InstrumentRules) -> Result<(), RiskError> {
    if rules.min_qty > 0.0 && qty + 1e-12 < rules.min_qty {
        return Err(RiskError::MinQty { qty, min: rules.min_qty });
    }
    Ok(())
}

/// Pre-trade min-notional check. Market orders carry no price, so the
/// caller passes the last known price as `price_hint`.
pub fn check_min_notional(order: &Order, price_hint: f64, rules: &InstrumentRules) -> Result<(), RiskError> {
    if rules.min_notional <= 0.0 {
        return Ok(());
    }
    let notional = if order.order_type == OrderType::Market && order.market_unit == Some(QtyUnit::QuoteCoin) {
        order.qty
    } else {
        let price = if order.order_type == OrderType::Market || order.price <= 0.0 { price_hint } else { order.price };
        if price <= 0.0 {
            return Err(RiskError::NoPrice);
        }
        price * order.qty
    };
    if notional + 1e-9 < rules.min_notional {
        return Err(RiskError::MinNotional { notional, min: rules.min_notional });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, Side};

    fn rules() -> InstrumentRules {
        InstrumentRules { tick_size: 0.01, lot_size: 0.001, min_qty: 0.001, min_notional: 5.0, ..Default::default() }
    }

    #[test]
    fn limit_uses_own_price() {
        let o = Order::request("BTCUSDT", Side::Buy, OrderType::Limit, OrderKind::Safety, 100.0, 0.04, "x-so-1".into());
        assert!(matches!(check_min_notional(&o, 0.0, &rules()), Err(RiskError::MinNotional { .. })));
        let o = Order { qty: 0.05, ..o };
        assert!(check_min_notional(&o, 0.0, &rules()).is_ok());
    }

    #[test]
    fn market_uses_hint_or_quote_qty() {
        let mut o = Order::request("BTCUSDT", Side::Buy, OrderType::Market, OrderKind::Entry, 0.0, 0.1, "x-entry".into());
        assert_eq!(check_min_notional(&o, 0.0, &rules()), Err(RiskError::NoPrice));
        assert!(check_min_notional(&o, 100.0, &rules()).is_ok());
        o.market_unit = Some(QtyUnit::QuoteCoin);
        o.qty = 4.0;
        assert!(check_min_notional(&o, 0.0, &rules()).is_err());
        o.qty = 6.0;
        assert!(check_min_notional(&o, 0.0, &rules()).is_ok());
    }

    #[test]
    fn zero_min_notional_skips() {
        let r = InstrumentRules { min_notional: 0.0, ..rules() };
        let o = Order::request("BTCUSDT", Side::Buy, OrderType::Market, OrderKind::Entry, 0.0, 0.1, "x-entry".into());
        assert!(check_min_notional(&o, 0.0, &r).is_ok());
    }

    #[test]
    fn min_qty() {
        assert!(check_min_qty(0.0005, &rules()).is_err());
        assert!(check_min_qty(0.001, &rules()).is_ok());
    }
}
