// ===============================
// src/deal.rs
// ===============================
//
// Deal state and its transitions. Everything here is synchronous and
// runs under the engine lock; callers act on the returned outcome
// (request close, schedule a TP rebuild) after releasing it.
//

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::calc::{avg_price, is_qty_zero};
use crate::domain::{Fill, Order, OrderStatus, Side, Ticker};
use crate::linkid;

#[derive(Debug, Clone, PartialEq)]
pub struct DealState {
    pub active: bool,
    pub closing: bool,
    pub close_requested: bool,
    pub close_reason: String,

    pub deal_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_link_id: String,
    pub avg_price: f64,
    pub total_qty: f64,

    pub filled_by_link: HashMap<String, f64>,
    pub processed_exec_ids: HashSet<String>,

    pub tp_order_id: String,
    pub tp_link_id: String,
    pub planned_tp_price: f64,
    pub planned_tp_qty: f64,
    pub tp_filled_qty: f64,

    /// link id -> exchange order id
    pub safety_orders: HashMap<String, String>,

    pub last_fill_seq: i64,
    pub last_order_seq: i64,
    pub last_ticker_seq: i64,

    pub last_fill_at: Option<Instant>,
    pub last_ticker: Option<Ticker>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Stale,
    Duplicate,
    /// Not part of the current deal, or an opposite-side fill that is not the TP.
    Ignored,
    TakeProfit { qty: f64, remaining: f64, flat: bool },
    PositionIncrease { qty: f64, total_qty: f64, avg_price: f64, partial: bool, aborted_close: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Stale,
    Applied,
    TpCancelled,
    TpFilled { remaining: f64, flat: bool },
}

/// Input for starting a fresh cycle from the averaged entry fill.
#[derive(Debug, Clone)]
pub struct EntryFill {
    pub deal_id: String,
    pub link_id: String,
    pub price: f64,
    pub qty: f64,
    pub exec_ids: Vec<String>,
}

/// Input for re-populating state from exchange truth after a restart.
#[derive(Debug, Clone, Default)]
pub struct Restored {
    pub deal_id: String,
    pub entry_price: f64,
    pub avg_price: f64,
    pub total_qty: f64,
    pub filled_by_link: HashMap<String, f64>,
    pub exec_ids: Vec<String>,
    pub tp_order_id: String,
    pub tp_link_id: String,
    pub tp_price: f64,
    pub tp_qty: f64,
    pub safety_orders: HashMap<String, String>,
}

fn seq_is_stale(seq: i64, watermark: i64) -> bool { seq > 0 && seq <= watermark }

impl DealState {
    pub fn new(symbol: &str, side: Side) -> Self {
        Self {
            active: false,
            closing: false,
            close_requested: false,
            close_reason: String::new(),
            deal_id: String::new(),
            symbol: symbol.to_string(),
            side,
            entry_price: 0.0,
            entry_link_id: String::new(),
            avg_price: 0.0,
            total_qty: 0.0,
            filled_by_link: HashMap::new(),
            processed_exec_ids: HashSet::new(),
            tp_order_id: String::new(),
            tp_link_id: String::new(),
            planned_tp_price: 0.0,
            planned_tp_qty: 0.0,
            tp_filled_qty: 0.0,
            safety_orders: HashMap::new(),
            last_fill_seq: 0,
            last_order_seq: 0,
            last_ticker_seq: 0,
            last_fill_at: None,
            last_ticker: None,
            updated_at: None,
            closed_at: None,
        }
    }

    pub fn last_price(&self) -> f64 { self.last_ticker.as_ref().map(|t| t.price).unwrap_or(0.0) }

    /// Whether the link id belongs to the running deal (or carries no deal id at all).
    fn owns_link(&self, link_id: &str) -> bool {
        match linkid::deal_id_of(link_id) {
            Some(id) => id == self.deal_id,
            None => true,
        }
    }

    pub fn is_tp_fill(&self, fill: &Fill) -> bool {
        linkid::is_tp(&fill.link_id)
            || (!self.tp_link_id.is_empty() && fill.link_id == self.tp_link_id)
            || (!self.tp_order_id.is_empty() && fill.order_id == self.tp_order_id)
    }

    pub fn begin(&mut self, entry: EntryFill, now: Instant) {
        self.active = true;
        self.closing = false;
        self.close_requested = false;
        self.close_reason.clear();
        self.deal_id = entry.deal_id;
        self.entry_price = entry.price;
        self.avg_price = entry.price;
        self.total_qty = entry.qty;
        self.tp_filled_qty = 0.0;
        self.filled_by_link.insert(entry.link_id.clone(), entry.qty);
        self.entry_link_id = entry.link_id;
        self.processed_exec_ids.extend(entry.exec_ids);
        self.last_fill_at = Some(now);
        self.updated_at = Some(Utc::now());
    }

    pub fn restore(&mut self, r: Restored) {
        self.active = true;
        self.closing = false;
        self.close_requested = false;
        self.close_reason.clear();
        self.entry_link_id = linkid::entry(&r.deal_id);
        self.deal_id = r.deal_id;
        self.entry_price = r.entry_price;
        self.avg_price = r.avg_price;
        self.total_qty = r.total_qty;
        self.filled_by_link = r.filled_by_link;
        self.processed_exec_ids.extend(r.exec_ids);
        self.tp_order_id = r.tp_order_id;
        self.tp_link_id = r.tp_link_id;
        self.planned_tp_price = r.tp_price;
        self.planned_tp_qty = r.tp_qty;
        self.tp_filled_qty = 0.0;
        self.safety_orders = r.safety_orders;
        self.updated_at = Some(Utc::now());
    }

    pub fn apply_fill(&mut self, fill: &Fill, lot_size: f64, now: Instant) -> FillOutcome {
        if seq_is_stale(fill.seq, self.last_fill_seq) {
            return FillOutcome::Stale;
        }
        if !fill.exec_id.is_empty() && self.processed_exec_ids.contains(&fill.exec_id) {
            return FillOutcome::Duplicate;
        }
        if fill.seq > 0 {
            self.last_fill_seq = fill.seq;
        }
        if !fill.exec_id.is_empty() {
            self.processed_exec_ids.insert(fill.exec_id.clone());
        }
        if !self.active || !self.owns_link(&fill.link_id) {
            return FillOutcome::Ignored;
        }
        self.last_fill_at = Some(now);
        self.updated_at = Some(Utc::now());

        if self.is_tp_fill(fill) {
            self.tp_filled_qty += fill.qty;
            self.total_qty = (self.total_qty - fill.qty).max(0.0);
            let flat = is_qty_zero(self.total_qty, lot_size);
            if flat {
                self.total_qty = 0.0;
            }
            return FillOutcome::TakeProfit { qty: fill.qty, remaining: self.total_qty, flat };
        }
        if fill.side != self.side {
            return FillOutcome::Ignored;
        }

        let prev = self.filled_by_link.get(&fill.link_id).copied().unwrap_or(0.0);
        self.filled_by_link.insert(fill.link_id.clone(), prev + fill.qty);
        let cost = self.avg_price * self.total_qty + fill.price * fill.qty;
        self.total_qty += fill.qty;
        self.avg_price = avg_price(cost, self.total_qty);
        let aborted_close = self.closing || self.close_requested;
        if aborted_close {
            self.abort_close();
        }
        FillOutcome::PositionIncrease {
            qty: fill.qty,
            total_qty: self.total_qty,
            avg_price: self.avg_price,
            partial: prev > 0.0,
            aborted_close,
        }
    }

    pub fn apply_order_update(&mut self, order: &Order, lot_size: f64) -> OrderOutcome {
        if seq_is_stale(order.seq, self.last_order_seq) {
            return OrderOutcome::Stale;
        }
        if order.seq > 0 {
            self.last_order_seq = order.seq;
        }
        let by_id = !self.tp_order_id.is_empty() && order.id == self.tp_order_id;
        if order.status == OrderStatus::Canceled && by_id {
            self.tp_order_id.clear();
            return OrderOutcome::TpCancelled;
        }
        let is_tp = by_id || (!self.tp_link_id.is_empty() && order.link_id == self.tp_link_id);
        if !(self.active && is_tp && order.status == OrderStatus::Filled) {
            return OrderOutcome::Applied;
        }
        let total = self.total_qty;
        self.total_qty = if order.filled_qty > 0.0 && order.filled_qty < total { total - order.filled_qty } else { 0.0 };
        if is_qty_zero(self.total_qty, lot_size) {
            self.total_qty = 0.0;
        }
        self.updated_at = Some(Utc::now());
        OrderOutcome::TpFilled { remaining: self.total_qty, flat: self.total_qty == 0.0 }
    }

    /// Price context only; returns false for stale ticks.
    pub fn apply_ticker(&mut self, ticker: &Ticker) -> bool {
        if seq_is_stale(ticker.seq, self.last_ticker_seq) {
            return false;
        }
        if ticker.seq > 0 {
            self.last_ticker_seq = ticker.seq;
        }
        self.last_ticker = Some(ticker.clone());
        true
    }

    /// Active -> Closing. False when there is nothing to close or a close is already running.
    pub fn begin_close(&mut self, reason: &str) -> bool {
        if !self.active || self.closing {
            return false;
        }
        self.closing = true;
        self.close_requested = true;
        self.close_reason = reason.to_string();
        true
    }

    pub fn abort_close(&mut self) {
        self.closing = false;
        self.close_requested = false;
        self.close_reason.clear();
    }

    /// Closing -> Idle. Symbol, side, watermarks and the last tick survive.
    pub fn reset(&mut self) -> bool {
        if !self.active {
            return false;
        }
        let mut fresh = DealState::new(&self.symbol, self.side);
        fresh.last_fill_seq = self.last_fill_seq;
        fresh.last_order_seq = self.last_order_seq;
        fresh.last_ticker_seq = self.last_ticker_seq;
        fresh.last_ticker = self.last_ticker.take();
        let now = Utc::now();
        fresh.closed_at = Some(now);
        fresh.updated_at = Some(now);
        *self = fresh;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, OrderType};

    const LOT: f64 = 0.001;

    fn fill(link: &str, exec: &str, side: Side, price: f64, qty: f64, seq: i64) -> Fill {
        Fill {
            order_id: format!("oid-{link}"),
            link_id: link.to_string(),
            exec_id: exec.to_string(),
            symbol: "BTCUSDT".into(),
            side,
            price,
            qty,
            ts: Utc::now(),
            seq,
        }
    }

    fn active_deal() -> DealState {
        let mut s = DealState::new("BTCUSDT", Side::Buy);
        s.begin(
            EntryFill { deal_id: "abc123".into(), link_id: "abc123-entry".into(), price: 100.0, qty: 1.0, exec_ids: vec!["e0".into()] },
            Instant::now(),
        );
        s.tp_link_id = "abc123-tp-1-1".into();
        s.tp_order_id = "tp-1".into();
        s
    }

    #[test]
    fn safety_fill_updates_average() {
        let mut s = active_deal();
        let out = s.apply_fill(&fill("abc123-so-1", "e1", Side::Buy, 90.0, 1.0, 1), LOT, Instant::now());
        match out {
            FillOutcome::PositionIncrease { total_qty, avg_price, aborted_close, .. } => {
                assert_eq!(total_qty, 2.0);
                assert!((avg_price - 95.0).abs() < 1e-9);
                assert!(!aborted_close);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.filled_by_link["abc123-so-1"], 1.0);
    }

    #[test]
    fn duplicate_exec_applies_once() {
        let mut s = active_deal();
        let f = fill("abc123-so-1", "e1", Side::Buy, 90.0, 1.0, 0);
        s.apply_fill(&f, LOT, Instant::now());
        assert_eq!(s.apply_fill(&f, LOT, Instant::now()), FillOutcome::Duplicate);
        assert_eq!(s.total_qty, 2.0);
        // the entry exec collected during open is already known
        let e = fill("abc123-entry", "e0", Side::Buy, 100.0, 1.0, 0);
        assert_eq!(s.apply_fill(&e, LOT, Instant::now()), FillOutcome::Duplicate);
    }

    #[test]
    fn stale_events_leave_state_untouched() {
        let mut s = active_deal();
        s.apply_fill(&fill("abc123-so-1", "e1", Side::Buy, 90.0, 1.0, 10), LOT, Instant::now());
        s.apply_ticker(&Ticker { symbol: "BTCUSDT".into(), price: 91.0, ts: Utc::now(), seq: 10 });
        let mut o = Order::request("BTCUSDT", Side::Sell, OrderType::Limit, OrderKind::TakeProfit, 96.0, 2.0, "abc123-tp-1-1".into());
        o.id = "tp-1".into();
        o.seq = 10;
        s.apply_order_update(&o, LOT);
        let before = s.clone();

        assert_eq!(s.apply_fill(&fill("abc123-so-2", "e2", Side::Buy, 80.0, 1.0, 10), LOT, Instant::now()), FillOutcome::Stale);
        assert_eq!(s.apply_fill(&fill("abc123-so-2", "e3", Side::Buy, 80.0, 1.0, 9), LOT, Instant::now()), FillOutcome::Stale);
        assert!(!s.apply_ticker(&Ticker { symbol: "BTCUSDT".into(), price: 1.0, ts: Utc::now(), seq: 10 }));
        o.status = OrderStatus::Filled;
        o.filled_qty = 2.0;
        assert_eq!(s.apply_order_update(&o, LOT), OrderOutcome::Stale);
        assert_eq!(s, before);
    }

    #[test]
    fn tp_fill_reduces_and_clamps() {
        let mut s = active_deal();
        let out = s.apply_fill(&fill("abc123-tp-1-1", "t1", Side::Sell, 101.0, 0.6, 0), LOT, Instant::now());
        assert_eq!(out, FillOutcome::TakeProfit { qty: 0.6, remaining: 0.4, flat: false });
        let out = s.apply_fill(&fill("abc123-tp-1-1", "t2", Side::Sell, 101.0, 0.5, 0), LOT, Instant::now());
        assert_eq!(out, FillOutcome::TakeProfit { qty: 0.5, remaining: 0.0, flat: true });
        assert!((s.avg_price - 100.0).abs() < 1e-9);
        assert!((s.tp_filled_qty - 1.1).abs() < 1e-9);
    }

    #[test]
    fn same_side_fill_aborts_close() {
        let mut s = active_deal();
        s.apply_fill(&fill("abc123-tp-1-1", "t1", Side::Sell, 101.0, 1.0, 0), LOT, Instant::now());
        assert!(s.begin_close("tp filled"));
        assert!(!s.begin_close("again"));
        let out = s.apply_fill(&fill("manual-1", "m1", Side::Buy, 99.0, 0.5, 0), LOT, Instant::now());
        assert!(matches!(out, FillOutcome::PositionIncrease { aborted_close: true, .. }));
        assert!(!s.closing && !s.close_requested);
        assert_eq!(s.total_qty, 0.5);
    }

    #[test]
    fn fills_of_other_deals_are_ignored() {
        let mut s = active_deal();
        let out = s.apply_fill(&fill("ffff00-tp", "x1", Side::Sell, 101.0, 1.0, 0), LOT, Instant::now());
        assert_eq!(out, FillOutcome::Ignored);
        assert_eq!(s.total_qty, 1.0);
    }

    #[test]
    fn tp_order_filled_status_derives_residual() {
        let mut s = active_deal();
        let mut o = Order::request("BTCUSDT", Side::Sell, OrderType::Limit, OrderKind::TakeProfit, 101.0, 1.0, "abc123-tp-1-1".into());
        o.id = "tp-1".into();
        o.status = OrderStatus::Filled;
        o.filled_qty = 0.4;
        assert_eq!(s.apply_order_update(&o, LOT), OrderOutcome::TpFilled { remaining: 0.6, flat: false });
        o.filled_qty = 0.6;
        assert_eq!(s.apply_order_update(&o, LOT), OrderOutcome::TpFilled { remaining: 0.0, flat: true });
    }

    #[test]
    fn tp_cancel_clears_order_id() {
        let mut s = active_deal();
        let mut o = Order::request("BTCUSDT", Side::Sell, OrderType::Limit, OrderKind::TakeProfit, 101.0, 1.0, "abc123-tp-1-1".into());
        o.id = "tp-1".into();
        o.status = OrderStatus::Canceled;
        assert_eq!(s.apply_order_update(&o, LOT), OrderOutcome::TpCancelled);
        assert!(s.tp_order_id.is_empty());
        assert_eq!(s.tp_link_id, "abc123-tp-1-1");
    }

    #[test]
    fn reset_keeps_watermarks() {
        let mut s = active_deal();
        s.apply_fill(&fill("abc123-so-1", "e1", Side::Buy, 90.0, 1.0, 7), LOT, Instant::now());
        assert!(s.reset());
        assert!(!s.active);
        assert!(s.deal_id.is_empty());
        assert!(s.processed_exec_ids.is_empty());
        assert_eq!(s.last_fill_seq, 7);
        assert!(s.closed_at.is_some());
        assert!(!s.reset());
    }
}
