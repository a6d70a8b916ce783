// ===============================
// src/gateway.rs (paper venue)
// ===============================
//
// In-memory spot exchange behind ExchangeClient. Used for DRY_RUN and as
// the integration-test double: market orders fill at the last price,
// resting limits fill when the price crosses them, every fill is pushed
// to subscribers as a Fill plus an Order(Filled) event.
//

use std::collections::VecDeque;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::calc::round_down;
use crate::domain::{Balance, Event, Fill, InstrumentRules, Order, OrderStatus, OrderType, QtyUnit, Side, Ticker};
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::ExchangeClient;

const EVENT_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Rules,
    Place,
    Cancel,
    OpenOrders,
    Fills,
    Balances,
}

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub symbol: String,
    pub rules: InstrumentRules,
    pub start_price: f64,
    pub quote_balance: f64,
    pub base_balance: f64,
}

impl PaperConfig {
    pub fn new(symbol: &str, start_price: f64, quote_balance: f64) -> Self {
        let (base, quote) = split_symbol(symbol);
        Self {
            symbol: symbol.to_string(),
            rules: InstrumentRules {
                tick_size: 0.01,
                lot_size: 0.000001,
                min_qty: 0.000001,
                min_notional: 1.0,
                base_coin: base,
                quote_coin: quote,
            },
            start_price,
            quote_balance,
            base_balance: 0.0,
        }
    }
}

/// `BTCUSDT` -> (`BTC`, `USDT`); unknown quotes leave the base empty.
pub fn split_symbol(symbol: &str) -> (String, String) {
    for q in ["USDT", "USDC", "BTC", "ETH", "EUR"] {
        if let Some(base) = symbol.strip_suffix(q) {
            if !base.is_empty() {
                return (base.to_string(), q.to_string());
            }
        }
    }
    (String::new(), String::new())
}

struct Book {
    rules: InstrumentRules,
    symbol: String,
    price: f64,
    seq: i64,
    next_id: u64,
    open: Vec<Order>,
    links: HashSet<String>,
    fills: Vec<Fill>,
    balances: HashMap<String, Balance>,
    subscribers: Vec<mpsc::Sender<Event>>,
    faults: HashMap<PaperOp, VecDeque<ExchangeError>>,
    hide_open_once: bool,
    placed: Vec<Order>,
    cancelled: Vec<String>,
}

impl Book {
    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn take_fault(&mut self, op: PaperOp) -> ExchangeResult<()> {
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn emit(&mut self, ev: Event) {
        self.subscribers.retain(|tx| !tx.is_closed());
        for tx in &self.subscribers {
            if tx.try_send(ev.clone()).is_err() {
                debug!(kind = ev.kind(), "paper subscriber lagging, event dropped");
            }
        }
    }

    fn ticker(&mut self) {
        let t = Ticker { symbol: self.symbol.clone(), price: self.price, ts: Utc::now(), seq: self.next_seq() };
        self.emit(Event::Ticker(t));
    }

    fn balance_mut(&mut self, coin: &str) -> &mut Balance {
        self.balances.entry(coin.to_string()).or_default()
    }

    fn move_balances(&mut self, side: Side, qty: f64, price: f64) {
        let (base, quote) = (self.rules.base_coin.clone(), self.rules.quote_coin.clone());
        let notional = qty * price;
        let (d_base, d_quote) = match side {
            Side::Buy => (qty, -notional),
            Side::Sell => (-qty, notional),
        };
        for (coin, delta) in [(base, d_base), (quote, d_quote)] {
            if coin.is_empty() {
                continue;
            }
            let b = self.balance_mut(&coin);
            b.wallet += delta;
            b.available = b.wallet;
        }
    }

    /// Execute `qty` of `order` at `price`; emits the fill and the order update.
    fn execute(&mut self, order: &mut Order, qty: f64, price: f64) {
        let qty = qty.min(order.leaves_qty());
        if qty <= 0.0 {
            return;
        }
        order.filled_qty += qty;
        order.status = if order.leaves_qty() <= self.rules.lot_size / 2.0 { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
        self.move_balances(order.side, qty, price);

        let fill = Fill {
            order_id: order.id.clone(),
            link_id: order.link_id.clone(),
            exec_id: self.next_id("exec"),
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            qty,
            ts: Utc::now(),
            seq: self.next_seq(),
        };
        self.fills.push(fill.clone());
        self.emit(Event::Fill(fill));

        let mut update = order.clone();
        update.seq = self.next_seq();
        self.emit(Event::Order(update));
    }

    /// Fill every resting limit the current price crosses, at its limit price.
    fn cross(&mut self) {
        let price = self.price;
        let mut i = 0;
        while i < self.open.len() {
            let o = &self.open[i];
            let crossed = match o.side {
                Side::Buy => price <= o.price,
                Side::Sell => price >= o.price,
            };
            if !crossed {
                i += 1;
                continue;
            }
            let mut o = self.open.remove(i);
            let (qty, px) = (o.leaves_qty(), o.price);
            self.execute(&mut o, qty, px);
        }
    }
}

pub struct PaperExchange {
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(cfg: PaperConfig) -> Self {
        let mut balances = HashMap::new();
        if !cfg.rules.quote_coin.is_empty() {
            balances.insert(cfg.rules.quote_coin.clone(), Balance { wallet: cfg.quote_balance, available: cfg.quote_balance });
        }
        if !cfg.rules.base_coin.is_empty() {
            balances.insert(cfg.rules.base_coin.clone(), Balance { wallet: cfg.base_balance, available: cfg.base_balance });
        }
        Self {
            book: Mutex::new(Book {
                rules: cfg.rules,
                symbol: cfg.symbol,
                price: cfg.start_price,
                seq: 0,
                next_id: 0,
                open: Vec::new(),
                links: HashSet::new(),
                fills: Vec::new(),
                balances,
                subscribers: Vec::new(),
                faults: HashMap::new(),
                hide_open_once: false,
                placed: Vec::new(),
                cancelled: Vec::new(),
            }),
        }
    }

    pub async fn price(&self) -> f64 { self.book.lock().await.price }

    /// Move the market: emits a ticker, then fills crossed limits.
    pub async fn set_price(&self, price: f64) {
        let mut b = self.book.lock().await;
        b.price = price;
        b.ticker();
        b.cross();
    }

    pub async fn set_balance(&self, coin: &str, wallet: f64) {
        let mut b = self.book.lock().await;
        let bal = b.balance_mut(coin);
        bal.wallet = wallet;
        bal.available = wallet;
    }

    /// Queue an error for the next call of `op`.
    pub async fn fail_next(&self, op: PaperOp, err: ExchangeError) {
        self.book.lock().await.faults.entry(op).or_default().push_back(err);
    }

    /// The next open-orders read returns nothing.
    pub async fn hide_open_orders_once(&self) {
        self.book.lock().await.hide_open_once = true;
    }

    /// Put a resting order on the book without going through placement.
    pub async fn seed_open_order(&self, mut order: Order) -> Order {
        let mut b = self.book.lock().await;
        if order.id.is_empty() {
            order.id = b.next_id("paper");
        }
        order.status = OrderStatus::New;
        b.links.insert(order.link_id.clone());
        b.open.push(order.clone());
        order
    }

    /// Add a historical fill without moving balances or emitting events.
    pub async fn seed_fill(&self, fill: Fill) {
        let mut b = self.book.lock().await;
        b.links.insert(fill.link_id.clone());
        b.fills.push(fill);
    }

    /// Drop a resting order silently, as if it vanished while disconnected.
    pub async fn remove_open_order(&self, link_id: &str) -> Option<Order> {
        let mut b = self.book.lock().await;
        let i = b.open.iter().position(|o| o.link_id == link_id)?;
        Some(b.open.remove(i))
    }

    /// Partially (or fully) fill a resting order at its limit price.
    pub async fn execute(&self, order_id: &str, qty: f64) -> bool {
        let mut b = self.book.lock().await;
        let Some(i) = b.open.iter().position(|o| o.id == order_id) else {
            return false;
        };
        let mut o = b.open.remove(i);
        let px = o.price;
        b.execute(&mut o, qty, px);
        if o.status != OrderStatus::Filled {
            b.open.insert(i, o);
        }
        true
    }

    pub async fn reconnect(&self) {
        self.book.lock().await.emit(Event::Reconnect);
    }

    pub async fn placed_orders(&self) -> Vec<Order> { self.book.lock().await.placed.clone() }

    pub async fn cancelled_ids(&self) -> Vec<String> { self.book.lock().await.cancelled.clone() }

    pub async fn open_orders_snapshot(&self) -> Vec<Order> { self.book.lock().await.open.clone() }

    pub async fn fills_snapshot(&self) -> Vec<Fill> { self.book.lock().await.fills.clone() }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules> {
        let mut b = self.book.lock().await;
        b.take_fault(PaperOp::Rules)?;
        if symbol != b.symbol {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        }
        Ok(b.rules.clone())
    }

    async fn subscribe(&self, symbol: &str) -> ExchangeResult<mpsc::Receiver<Event>> {
        let mut b = self.book.lock().await;
        if symbol != b.symbol {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        b.subscribers.push(tx);
        if b.price > 0.0 {
            b.ticker();
        }
        Ok(rx)
    }

    async fn place_order(&self, order: &Order) -> ExchangeResult<Order> {
        let mut b = self.book.lock().await;
        b.take_fault(PaperOp::Place)?;
        if order.symbol != b.symbol {
            return Err(ExchangeError::UnknownSymbol(order.symbol.clone()));
        }
        if !order.link_id.is_empty() && b.links.contains(&order.link_id) {
            return Err(ExchangeError::DuplicateLinkId(order.link_id.clone()));
        }

        let mut o = order.clone();
        o.id = b.next_id("paper");
        o.filled_qty = 0.0;
        o.status = OrderStatus::New;
        let lot = b.rules.lot_size;

        match o.order_type {
            OrderType::Market => {
                let price = b.price;
                if price <= 0.0 {
                    return Err(ExchangeError::Rejected { code: 170130, msg: "no market price".into() });
                }
                if o.market_unit == Some(QtyUnit::QuoteCoin) {
                    o.qty = round_down(o.qty / price, lot);
                    o.market_unit = Some(QtyUnit::BaseCoin);
                }
                if o.qty <= 0.0 {
                    return Err(ExchangeError::Rejected { code: 170136, msg: "order quantity too small".into() });
                }
                check_funds(&b, o.side, o.qty, price)?;
                b.links.insert(o.link_id.clone());
                b.placed.push(o.clone());
                let mut filled = o.clone();
                let qty = filled.qty;
                b.execute(&mut filled, qty, price);
            }
            OrderType::Limit => {
                if o.price <= 0.0 || o.qty <= 0.0 {
                    return Err(ExchangeError::Rejected { code: 170136, msg: "invalid price or quantity".into() });
                }
                if o.side == Side::Sell {
                    check_funds(&b, o.side, o.qty, o.price)?;
                }
                b.links.insert(o.link_id.clone());
                b.placed.push(o.clone());
                let mut update = o.clone();
                update.seq = b.next_seq();
                b.emit(Event::Order(update));
                b.open.push(o.clone());
                b.cross();
            }
        }
        Ok(o)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let mut b = self.book.lock().await;
        b.take_fault(PaperOp::Cancel)?;
        let i = b
            .open
            .iter()
            .position(|o| o.id == order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        let mut o = b.open.remove(i);
        o.status = OrderStatus::Canceled;
        o.seq = b.next_seq();
        b.cancelled.push(o.id.clone());
        b.emit(Event::Order(o));
        Ok(())
    }

    async fn get_open_orders(&self, _symbol: &str) -> ExchangeResult<Vec<Order>> {
        let mut b = self.book.lock().await;
        b.take_fault(PaperOp::OpenOrders)?;
        if b.hide_open_once {
            b.hide_open_once = false;
            return Ok(Vec::new());
        }
        Ok(b.open.clone())
    }

    async fn get_fills(&self, _symbol: &str) -> ExchangeResult<Vec<Fill>> {
        let mut b = self.book.lock().await;
        b.take_fault(PaperOp::Fills)?;
        Ok(b.fills.clone())
    }

    async fn get_balances(&self, coins: &[String]) -> ExchangeResult<HashMap<String, Balance>> {
        let mut b = self.book.lock().await;
        b.take_fault(PaperOp::Balances)?;
        Ok(coins.iter().filter_map(|c| b.balances.get(c).map(|bal| (c.clone(), *bal))).collect())
    }
}

fn check_funds(b: &Book, side: Side, qty: f64, price: f64) -> ExchangeResult<()> {
    let (coin, need) = match side {
        Side::Buy => (&b.rules.quote_coin, qty * price),
        Side::Sell => (&b.rules.base_coin, qty),
    };
    if coin.is_empty() {
        return Ok(());
    }
    let have = b.balances.get(coin).map(|x| x.available).unwrap_or(0.0);
    if have + 1e-9 < need {
        return Err(ExchangeError::Rejected { code: 170131, msg: format!("insufficient {coin} balance") });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderKind;

    fn paper() -> PaperExchange { PaperExchange::new(PaperConfig::new("BTCUSDT", 100.0, 10_000.0)) }

    fn market(link: &str, side: Side, qty: f64, unit: QtyUnit) -> Order {
        let mut o = Order::request("BTCUSDT", side, OrderType::Market, OrderKind::Entry, 0.0, qty, link.to_string());
        o.market_unit = Some(unit);
        o
    }

    #[test]
    fn splits_known_quotes() {
        assert_eq!(split_symbol("BTCUSDT"), ("BTC".to_string(), "USDT".to_string()));
        assert_eq!(split_symbol("ETHBTC"), ("ETH".to_string(), "BTC".to_string()));
        assert_eq!(split_symbol("XYZ"), (String::new(), String::new()));
    }

    #[tokio::test]
    async fn quote_market_buy_fills_at_last_price() {
        let p = paper();
        let mut rx = p.subscribe("BTCUSDT").await.unwrap();
        let placed = p.place_order(&market("d-entry", Side::Buy, 50.0, QtyUnit::QuoteCoin)).await.unwrap();
        assert!((placed.qty - 0.5).abs() < 1e-9);

        let bal = p.get_balances(&["BTC".into(), "USDT".into()]).await.unwrap();
        assert!((bal["BTC"].wallet - 0.5).abs() < 1e-9);
        assert!((bal["USDT"].wallet - 9_950.0).abs() < 1e-6);

        assert!(matches!(rx.recv().await, Some(Event::Ticker(_))));
        match rx.recv().await {
            Some(Event::Fill(f)) => {
                assert_eq!(f.link_id, "d-entry");
                assert_eq!(f.price, 100.0);
            }
            other => panic!("expected fill, got {other:?}"),
        }
        match rx.recv().await {
            Some(Event::Order(o)) => assert_eq!(o.status, OrderStatus::Filled),
            other => panic!("expected order update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resting_limit_fills_when_crossed() {
        let p = paper();
        let mut o = Order::request("BTCUSDT", Side::Buy, OrderType::Limit, OrderKind::Safety, 95.0, 1.0, "d-so-1".into());
        o.price_step = 0.01;
        let placed = p.place_order(&o).await.unwrap();
        assert_eq!(p.open_orders_snapshot().await.len(), 1);

        p.set_price(96.0).await;
        assert_eq!(p.open_orders_snapshot().await.len(), 1);
        p.set_price(94.0).await;
        assert!(p.open_orders_snapshot().await.is_empty());

        let fills = p.get_fills("BTCUSDT").await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, placed.id);
        assert_eq!(fills[0].price, 95.0);
    }

    #[tokio::test]
    async fn rejects_reused_link_and_unknown_cancel() {
        let p = paper();
        p.place_order(&market("d-entry", Side::Buy, 1.0, QtyUnit::BaseCoin)).await.unwrap();
        let err = p.place_order(&market("d-entry", Side::Buy, 1.0, QtyUnit::BaseCoin)).await.unwrap_err();
        assert!(err.is_duplicate());
        assert!(p.cancel_order("BTCUSDT", "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let p = paper();
        p.fail_next(PaperOp::OpenOrders, ExchangeError::RateLimited("10006".into())).await;
        assert!(p.get_open_orders("BTCUSDT").await.unwrap_err().is_rate_limit());
        assert!(p.get_open_orders("BTCUSDT").await.is_ok());

        p.seed_open_order(Order::request("BTCUSDT", Side::Buy, OrderType::Limit, OrderKind::Safety, 90.0, 1.0, "d-so-1".into())).await;
        p.hide_open_orders_once().await;
        assert!(p.get_open_orders("BTCUSDT").await.unwrap().is_empty());
        assert_eq!(p.get_open_orders("BTCUSDT").await.unwrap().len(), 1);
    }
}
