// ===============================
// src/restore.rs
// ===============================
//
// Rebuild deal state from exchange truth (open orders + fill history)
// after a restart. Nothing is persisted locally.
//

use ahash::AHashMap as HashMap;
use tracing::{debug, info};

use crate::calc::{avg_price, tp_price};
use crate::deal::Restored;
use crate::domain::{Fill, Order, Side};
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::linkid;

/// Position and order roles derived for one deal id.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub side: Side,
    pub tp: Option<Order>,
    pub safety_orders: HashMap<String, String>,
    pub entry_price: f64,
    pub avg_price: f64,
    pub total_qty: f64,
    pub filled_by_link: HashMap<String, f64>,
    pub exec_ids: Vec<String>,
}

/// Prefer a deal that still has a TP resting, else the one with the most
/// open orders. Ties break on the id so the choice is stable.
pub fn pick_deal_id(groups: &HashMap<String, Vec<Order>>) -> Option<String> {
    let has_tp = |orders: &Vec<Order>| orders.iter().any(|o| linkid::is_tp(&o.link_id));
    groups
        .iter()
        .max_by(|(a_id, a), (b_id, b)| {
            has_tp(a)
                .cmp(&has_tp(b))
                .then(a.len().cmp(&b.len()))
                .then(b_id.cmp(a_id))
        })
        .map(|(id, _)| id.clone())
}

pub fn group_by_deal(open: &[Order]) -> HashMap<String, Vec<Order>> {
    let mut groups: HashMap<String, Vec<Order>> = HashMap::new();
    for o in open {
        if let Some(id) = linkid::deal_id_of(&o.link_id) {
            groups.entry(id.to_string()).or_default().push(o.clone());
        }
    }
    groups
}

/// Net the deal's fill history into a position.
pub fn reconstruct(deal_id: &str, orders: &[Order], fills: &[Fill], default_side: Side) -> Reconstruction {
    let mut tp: Option<Order> = None;
    let mut safety_orders = HashMap::new();
    let mut side_hint = None;
    for o in orders {
        if linkid::is_tp(&o.link_id) {
            // keep the newest TP if several survived
            if tp.as_ref().map(|t| o.seq >= t.seq).unwrap_or(true) {
                tp = Some(o.clone());
            }
        } else if linkid::is_safety(&o.link_id) {
            safety_orders.insert(o.link_id.clone(), o.id.clone());
            side_hint.get_or_insert(o.side);
        } else if linkid::is_entry(&o.link_id) {
            side_hint.get_or_insert(o.side);
        }
    }
    let side = side_hint.or_else(|| tp.as_ref().map(|t| t.side.opposite())).unwrap_or(default_side);

    let prefix = format!("{deal_id}-");
    let mut filled_by_link = HashMap::new();
    let mut exec_ids = Vec::new();
    let (mut qty_in, mut cost_in, mut qty_out) = (0.0, 0.0, 0.0);
    let mut first_in: Option<&Fill> = None;
    for f in fills.iter().filter(|f| f.link_id.starts_with(&prefix)) {
        if !f.exec_id.is_empty() {
            exec_ids.push(f.exec_id.clone());
        }
        *filled_by_link.entry(f.link_id.clone()).or_insert(0.0) += f.qty;
        if f.side == side {
            qty_in += f.qty;
            cost_in += f.price * f.qty;
            if first_in.map(|e| f.ts < e.ts).unwrap_or(true) {
                first_in = Some(f);
            }
        } else {
            qty_out += f.qty;
        }
    }
    let avg = avg_price(cost_in, qty_in);
    let entry_price = first_in.map(|f| f.price).unwrap_or(avg);

    Reconstruction {
        side,
        tp,
        safety_orders,
        entry_price,
        avg_price: avg,
        total_qty: (qty_in - qty_out).max(0.0),
        filled_by_link,
        exec_ids,
    }
}

impl Engine {
    /// Adopt the deal the exchange still shows, if any. Returns whether a
    /// deal is now active.
    pub async fn restore(&self) -> EngineResult<bool> {
        let open = self.open_orders().await?;
        let groups = group_by_deal(&open);
        let deal_id = match pick_deal_id(&groups) {
            Some(id) => id,
            None => {
                info!(open = open.len(), "nothing to restore");
                return Ok(false);
            }
        };
        let orders = groups.get(&deal_id).cloned().unwrap_or_default();
        for o in &orders {
            debug!(deal_id = %deal_id, link_id = %o.link_id, order_id = %o.id, side = o.side.as_str(), price = o.price, qty = o.qty, "restore candidate");
        }

        let fills = self.fills().await?;
        let mut r = reconstruct(&deal_id, &orders, &fills, self.cfg.side);
        if let Some(tp) = &r.tp {
            if r.total_qty <= 0.0 {
                r.total_qty = tp.qty;
            }
        } else {
            if r.total_qty <= 0.0 {
                info!(deal_id = %deal_id, "restore skipped, no position and no take-profit");
                return Ok(false);
            }
            if r.side == Side::Buy {
                let balance = self.base_balance().await?;
                if self.is_qty_zero(self.round_qty(balance)) {
                    info!(deal_id = %deal_id, total_qty = r.total_qty, "restore skipped, base balance is flat");
                    return Ok(false);
                }
            }
        }

        let (tp_order_id, tp_link_id, tp_px, tp_qty) = match &r.tp {
            Some(t) => (t.id.clone(), t.link_id.clone(), t.price, t.qty),
            None => (String::new(), String::new(), 0.0, 0.0),
        };
        let need_tp = r.tp.is_none();
        let legs = r.safety_orders.len();
        {
            let mut st = self.state().await;
            st.deal.side = r.side;
            st.deal.restore(Restored {
                deal_id: deal_id.clone(),
                entry_price: r.entry_price,
                avg_price: r.avg_price,
                total_qty: r.total_qty,
                filled_by_link: r.filled_by_link,
                exec_ids: r.exec_ids,
                tp_order_id,
                tp_link_id,
                tp_price: tp_px,
                tp_qty,
                safety_orders: r.safety_orders,
            });
            Engine::publish_gauges(&st.deal);
        }
        info!(
            deal_id = %deal_id,
            side = r.side.as_str(),
            entry = r.entry_price,
            avg = r.avg_price,
            total_qty = r.total_qty,
            tp = !need_tp,
            safety_orders = legs,
            "deal restored"
        );

        if need_tp {
            let base = if r.avg_price > 0.0 { r.avg_price } else { r.entry_price };
            if base > 0.0 {
                let price = self.round_price(tp_price(base, self.cfg.tp_percent, r.side));
                self.place_tp(price, self.round_qty(r.total_qty)).await?;
            }
        }
        self.rebuild_missing_safety_orders().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, OrderType};
    use chrono::{TimeZone, Utc};

    fn open(link: &str, side: Side, qty: f64) -> Order {
        let mut o = Order::request("BTCUSDT", side, OrderType::Limit, linkid::kind_of(link), 90.0, qty, link.to_string());
        o.id = format!("id-{link}");
        o
    }

    fn fill(link: &str, side: Side, price: f64, qty: f64, sec: i64) -> Fill {
        Fill {
            order_id: format!("id-{link}"),
            link_id: link.to_string(),
            exec_id: format!("ex-{link}-{sec}"),
            symbol: "BTCUSDT".into(),
            side,
            price,
            qty,
            ts: Utc.timestamp_opt(1_700_000_000 + sec, 0).unwrap(),
            seq: 0,
        }
    }

    #[test]
    fn deal_with_tp_wins_over_larger_group() {
        let orders = vec![
            open("aaa-so-1", Side::Buy, 1.0),
            open("aaa-so-2", Side::Buy, 1.0),
            open("aaa-so-3", Side::Buy, 1.0),
            open("bbb-tp-1700000000-1", Side::Sell, 1.0),
            open("manual-order", Side::Buy, 1.0),
        ];
        let groups = group_by_deal(&orders);
        assert_eq!(groups.len(), 2);
        assert_eq!(pick_deal_id(&groups).as_deref(), Some("bbb"));
    }

    #[test]
    fn largest_group_when_no_tp() {
        let orders = vec![open("aaa-so-1", Side::Buy, 1.0), open("bbb-so-1", Side::Buy, 1.0), open("bbb-so-2", Side::Buy, 1.0)];
        assert_eq!(pick_deal_id(&group_by_deal(&orders)).as_deref(), Some("bbb"));
        assert_eq!(pick_deal_id(&HashMap::new()), None);
    }

    #[test]
    fn nets_fills_into_position() {
        let orders = vec![open("abc123-tp-1700000000-1", Side::Sell, 5.0), open("abc123-so-2", Side::Buy, 2.0)];
        let fills = vec![
            fill("abc123-so-1", Side::Buy, 95.0, 2.0, 10),
            fill("abc123-entry", Side::Buy, 100.0, 3.0, 1),
            fill("other-entry", Side::Buy, 50.0, 9.0, 0),
        ];
        let r = reconstruct("abc123", &orders, &fills, Side::Sell);
        assert_eq!(r.side, Side::Buy);
        assert_eq!(r.tp.as_ref().map(|t| t.kind), Some(OrderKind::TakeProfit));
        assert!((r.total_qty - 5.0).abs() < 1e-9);
        assert!((r.avg_price - 98.0).abs() < 1e-9);
        assert_eq!(r.entry_price, 100.0);
        assert_eq!(r.exec_ids.len(), 2);
        assert_eq!(r.filled_by_link.get("abc123-so-1"), Some(&2.0));
        assert_eq!(r.safety_orders.get("abc123-so-2").map(String::as_str), Some("id-abc123-so-2"));
    }

    #[test]
    fn opposite_fills_reduce_position() {
        let fills = vec![
            fill("d1-entry", Side::Buy, 100.0, 3.0, 1),
            fill("d1-tp-1700000000-1", Side::Sell, 101.0, 1.0, 5),
        ];
        let r = reconstruct("d1", &[], &fills, Side::Buy);
        assert!((r.total_qty - 2.0).abs() < 1e-9);
        assert_eq!(r.avg_price, 100.0);
    }

    #[test]
    fn side_falls_back_to_opposite_of_tp() {
        let orders = vec![open("d2-tp-1700000000-1", Side::Buy, 1.0)];
        let r = reconstruct("d2", &orders, &[], Side::Buy);
        assert_eq!(r.side, Side::Sell);
        assert_eq!(r.total_qty, 0.0);
    }
}
