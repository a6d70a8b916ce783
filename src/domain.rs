// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "Buy", Side::Sell => "Sell" } }

    /// Case-insensitive parse of "buy"/"sell".
    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType { Market, Limit }
impl OrderType {
    pub fn as_str(&self) -> &'static str { match self { OrderType::Market => "Market", OrderType::Limit => "Limit" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus { New, PartiallyFilled, Filled, Canceled, Rejected, Unknown }
impl OrderStatus {
    pub fn parse(s: &str) -> OrderStatus {
        match s {
            "New" | "Created" | "Untriggered" => OrderStatus::New,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "Canceled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Canceled,
            "Rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind { Entry, TakeProfit, Safety, Other }

/// Unit of the configured entry size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QtyUnit { BaseCoin, QuoteCoin }
impl QtyUnit {
    pub fn as_str(&self) -> &'static str { match self { QtyUnit::BaseCoin => "baseCoin", QtyUnit::QuoteCoin => "quoteCoin" } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub link_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub kind: OrderKind,
    pub price: f64,
    pub qty: f64,
    pub filled_qty: f64,
    pub status: OrderStatus,
    pub seq: i64,
    pub reduce_only: bool,
    pub time_in_force: String,
    /// Only meaningful for market orders.
    pub market_unit: Option<QtyUnit>,
    pub price_step: f64,
    pub qty_step: f64,
}

impl Order {
    /// Request skeleton; the exchange fills in `id`, `status` and `seq`.
    pub fn request(symbol: &str, side: Side, order_type: OrderType, kind: OrderKind, price: f64, qty: f64, link_id: String) -> Self {
        Self {
            id: String::new(),
            link_id,
            symbol: symbol.to_string(),
            side,
            order_type,
            kind,
            price,
            qty,
            filled_qty: 0.0,
            status: OrderStatus::New,
            seq: 0,
            reduce_only: false,
            time_in_force: if order_type == OrderType::Market { "IOC".into() } else { "GTC".into() },
            market_unit: None,
            price_step: 0.0,
            qty_step: 0.0,
        }
    }

    pub fn leaves_qty(&self) -> f64 { (self.qty - self.filled_qty).max(0.0) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub link_id: String,
    pub exec_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub ts: DateTime<Utc>,
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub ts: DateTime<Utc>,
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Ticker(Ticker), Order(Order), Fill(Fill), Reconnect }

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Ticker(_) => "ticker",
            Event::Order(_) => "order",
            Event::Fill(_) => "fill",
            Event::Reconnect => "reconnect",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
    pub base_coin: String,
    pub quote_coin: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance { pub wallet: f64, pub available: f64 }
impl Balance {
    /// Wallet balance when the exchange reports one, otherwise the available amount.
    pub fn effective(&self) -> f64 { if self.wallet > 0.0 { self.wallet } else { self.available } }
}
