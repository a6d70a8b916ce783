// ===============================
// src/bybit.rs
// ===============================
//
// Bybit v5 wire helpers: signing, typed response envelopes, step formatting
// and the mapping from REST/WS payloads to domain records.
//

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::calc::step_decimals;
use crate::domain::{Balance, Fill, InstrumentRules, Order, OrderStatus, OrderType, Side, Ticker};
use crate::error::ExchangeError;
use crate::linkid;

type HmacSha256 = Hmac<Sha256>;

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn sign(secret: &str, payload: &str) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// REST signature: timestamp + apiKey + recvWindow + (query string | json body).
pub fn sign_rest(secret: &str, ts: u64, api_key: &str, recv_window: u64, payload: &str) -> String {
    sign(secret, &format!("{ts}{api_key}{recv_window}{payload}"))
}

/// Args of the private WS `auth` op.
pub fn ws_auth_args(api_key: &str, secret: &str, expires: u64) -> Vec<String> {
    let sig = sign(secret, &format!("GET/realtime{expires}"));
    vec![api_key.to_string(), expires.to_string(), sig]
}

/// Quantize down to `step` and print with the step's decimals.
pub fn format_with_step(value: f64, step: f64) -> String {
    if step <= 0.0 {
        return format!("{value}");
    }
    let quantized = ((value / step) + 1e-9).floor() * step;
    format!("{:.*}", step_decimals(step), quantized)
}

fn parse_f64(s: &str) -> f64 { s.trim().parse().unwrap_or(0.0) }

fn parse_ms(s: &str) -> DateTime<Utc> {
    ms_to_time(s.trim().parse().unwrap_or(0))
}

fn ms_to_time(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_side(s: &str) -> Side { Side::parse(s).unwrap_or(Side::Buy) }

fn parse_order_type(s: &str) -> OrderType {
    if s.eq_ignore_ascii_case("market") { OrderType::Market } else { OrderType::Limit }
}

/// Map a non-zero retCode (or HTTP failure) to a classified error.
pub fn classify(code: i64, msg: &str, http_status: u16) -> ExchangeError {
    let lower = msg.to_ascii_lowercase();
    if code == 10006 || http_status == 429 || lower.contains("too many visits") || lower.contains("rate limit") {
        ExchangeError::RateLimited(format!("{code}: {msg}"))
    } else if code == 170141 || lower.contains("duplicate clientorderid") || lower.contains("orderlinkid is duplicate") {
        ExchangeError::DuplicateLinkId(msg.to_string())
    } else if code == 170213 || code == 110001 || lower.contains("order does not exist") {
        ExchangeError::OrderNotFound(msg.to_string())
    } else if code == 10000 || code == 10016 || http_status >= 500 {
        ExchangeError::Transport(format!("{code}: {msg}"))
    } else if code == 10001 && lower.contains("symbol") {
        ExchangeError::UnknownSymbol(msg.to_string())
    } else {
        ExchangeError::Rejected { code, msg: msg.to_string() }
    }
}

// ---- REST envelope ----
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default = "Option::default")]
    pub result: Option<T>,
}

impl<T: Default> ApiResponse<T> {
    pub fn into_result(self, http_status: u16) -> Result<T, ExchangeError> {
        if self.ret_code != 0 {
            return Err(classify(self.ret_code, &self.ret_msg, http_status));
        }
        if http_status >= 400 {
            return Err(classify(0, &self.ret_msg, http_status));
        }
        Ok(self.result.unwrap_or_default())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriceFilter { pub tick_size: String }

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LotSizeFilter {
    pub base_precision: String,
    pub qty_step: String,
    pub min_order_qty: String,
    pub min_order_amt: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstrumentItem {
    pub symbol: String,
    pub base_coin: String,
    pub quote_coin: String,
    pub price_filter: PriceFilter,
    pub lot_size_filter: LotSizeFilter,
}

impl InstrumentItem {
    pub fn into_rules(self) -> Result<InstrumentRules, ExchangeError> {
        let mut lot = parse_f64(&self.lot_size_filter.qty_step);
        if lot <= 0.0 {
            lot = parse_f64(&self.lot_size_filter.base_precision);
        }
        if lot <= 0.0 {
            return Err(ExchangeError::Decode(format!("no lot size for {}", self.symbol)));
        }
        Ok(InstrumentRules {
            tick_size: parse_f64(&self.price_filter.tick_size),
            lot_size: lot,
            min_qty: parse_f64(&self.lot_size_filter.min_order_qty),
            min_notional: parse_f64(&self.lot_size_filter.min_order_amt),
            base_coin: self.base_coin,
            quote_coin: self.quote_coin,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOrderResult {
    pub order_id: String,
    pub order_link_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Empty {}

/// Shared by `/v5/order/realtime` and the private `order` topic.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderItem {
    pub order_id: String,
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: String,
    pub qty: String,
    pub leaves_qty: String,
    pub cum_exec_qty: String,
    pub order_status: String,
    pub time_in_force: String,
    pub reduce_only: bool,
    pub seq: i64,
}

impl OrderItem {
    pub fn into_order(self, fallback_symbol: &str) -> Order {
        let qty = parse_f64(&self.qty);
        let filled = if self.cum_exec_qty.is_empty() {
            (qty - parse_f64(&self.leaves_qty)).max(0.0)
        } else {
            parse_f64(&self.cum_exec_qty)
        };
        let symbol = if self.symbol.is_empty() { fallback_symbol.to_string() } else { self.symbol };
        Order {
            kind: linkid::kind_of(&self.order_link_id),
            id: self.order_id,
            link_id: self.order_link_id,
            symbol,
            side: parse_side(&self.side),
            order_type: parse_order_type(&self.order_type),
            price: parse_f64(&self.price),
            qty,
            filled_qty: filled,
            status: OrderStatus::parse(&self.order_status),
            seq: self.seq,
            reduce_only: self.reduce_only,
            time_in_force: self.time_in_force,
            market_unit: None,
            price_step: 0.0,
            qty_step: 0.0,
        }
    }
}

/// Shared by `/v5/execution/list` and the private `execution` topic.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionItem {
    pub order_id: String,
    pub order_link_id: String,
    pub exec_id: String,
    pub symbol: String,
    pub side: String,
    pub exec_price: String,
    pub exec_qty: String,
    pub exec_time: String,
    pub seq: i64,
}

impl ExecutionItem {
    pub fn into_fill(self, fallback_symbol: &str) -> Fill {
        let symbol = if self.symbol.is_empty() { fallback_symbol.to_string() } else { self.symbol };
        Fill {
            order_id: self.order_id,
            link_id: self.order_link_id,
            exec_id: self.exec_id,
            symbol,
            side: parse_side(&self.side),
            price: parse_f64(&self.exec_price),
            qty: parse_f64(&self.exec_qty),
            ts: parse_ms(&self.exec_time),
            seq: self.seq,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoinBalance {
    pub coin: String,
    pub wallet_balance: String,
    pub available_to_withdraw: String,
    pub available_balance: String,
}

impl CoinBalance {
    pub fn to_balance(&self) -> Balance {
        let wallet = parse_f64(&self.wallet_balance);
        let mut available = parse_f64(&self.available_to_withdraw);
        if available == 0.0 {
            available = parse_f64(&self.available_balance);
        }
        if available == 0.0 {
            available = wallet;
        }
        Balance { wallet, available }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WalletAccount { pub coin: Vec<CoinBalance> }

// ---- WebSocket ----
#[derive(Debug, Serialize)]
pub struct WsOp<'a> {
    pub op: &'a str,
    pub args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WsMessage {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    pub data: serde_json::Value,
    /// Present on op acknowledgements (auth / subscribe / pong).
    pub op: String,
    pub success: Option<bool>,
    pub ret_msg: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TickerItem {
    pub symbol: String,
    pub last_price: String,
    pub seq: i64,
    pub ts: i64,
}

fn items<T: for<'de> Deserialize<'de>>(data: &serde_json::Value) -> Result<Vec<T>, serde_json::Error> {
    if data.is_array() {
        serde_json::from_value(data.clone())
    } else {
        Ok(vec![serde_json::from_value(data.clone())?])
    }
}

/// Sequence falls back to the item ts, then the message ts.
pub fn parse_tickers(msg: &WsMessage) -> Result<Vec<Ticker>, serde_json::Error> {
    let list: Vec<TickerItem> = items(&msg.data)?;
    Ok(list
        .into_iter()
        .filter_map(|t| {
            let price = parse_f64(&t.last_price);
            if price <= 0.0 {
                return None;
            }
            let seq = if t.seq > 0 { t.seq } else if t.ts > 0 { t.ts } else { msg.ts };
            Some(Ticker { symbol: t.symbol, price, ts: ms_to_time(msg.ts), seq })
        })
        .collect())
}

pub fn parse_orders(msg: &WsMessage) -> Result<Vec<Order>, serde_json::Error> {
    let list: Vec<OrderItem> = items(&msg.data)?;
    Ok(list.into_iter().map(|o| o.into_order("")).collect())
}

pub fn parse_executions(msg: &WsMessage) -> Result<Vec<Fill>, serde_json::Error> {
    let list: Vec<ExecutionItem> = items(&msg.data)?;
    Ok(list.into_iter().map(|e| e.into_fill("")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_reference_vector() {
        assert_eq!(
            sign("key", "The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
        assert_eq!(sign_rest("key", 1, "k", 5000, "a=b"), sign("key", "1k5000a=b"));
        assert_eq!(ws_auth_args("k", "s", 42)[2], sign("s", "GET/realtime42"));
    }

    #[test]
    fn step_formatting() {
        assert_eq!(format_with_step(1.23456, 0.01), "1.23");
        assert_eq!(format_with_step(0.3, 0.1), "0.3");
        assert_eq!(format_with_step(12.0, 1.0), "12");
        assert_eq!(format_with_step(0.0019, 0.001), "0.001");
        assert_eq!(format_with_step(1.5, 0.0), "1.5");
    }

    #[test]
    fn ret_codes_are_classified() {
        assert!(classify(10006, "Too many visits!", 200).is_rate_limit());
        assert!(classify(0, "", 429).is_rate_limit());
        assert!(classify(170141, "Duplicate clientOrderId", 200).is_duplicate());
        assert!(classify(170213, "Order does not exist.", 200).is_not_found());
        assert!(classify(10016, "server error", 200).is_retryable());
        assert!(classify(0, "", 502).is_retryable());
        assert!(matches!(classify(170131, "Insufficient balance", 200), ExchangeError::Rejected { code: 170131, .. }));
    }

    #[test]
    fn envelope_decodes_and_maps_errors() {
        let ok: ApiResponse<CreateOrderResult> =
            serde_json::from_str(r#"{"retCode":0,"retMsg":"OK","result":{"orderId":"1","orderLinkId":"a-entry"}}"#).unwrap();
        assert_eq!(ok.into_result(200).unwrap().order_id, "1");
        let dup: ApiResponse<CreateOrderResult> =
            serde_json::from_str(r#"{"retCode":170141,"retMsg":"Duplicate clientOrderId","result":{}}"#).unwrap();
        assert!(dup.into_result(200).unwrap_err().is_duplicate());
    }

    #[test]
    fn instrument_lot_falls_back_to_base_precision() {
        let raw = r#"{"symbol":"BTCUSDT","baseCoin":"BTC","quoteCoin":"USDT",
            "priceFilter":{"tickSize":"0.01"},
            "lotSizeFilter":{"basePrecision":"0.000001","minOrderQty":"0.000048","minOrderAmt":"1"}}"#;
        let item: InstrumentItem = serde_json::from_str(raw).unwrap();
        let rules = item.into_rules().unwrap();
        assert_eq!(rules.lot_size, 0.000001);
        assert_eq!(rules.min_notional, 1.0);
        assert_eq!(rules.base_coin, "BTC");

        let bad: InstrumentItem = serde_json::from_str(r#"{"symbol":"X","lotSizeFilter":{}}"#).unwrap();
        assert!(bad.into_rules().is_err());
    }

    #[test]
    fn ticker_seq_fallbacks() {
        let msg: WsMessage = serde_json::from_str(
            r#"{"topic":"tickers.BTCUSDT","ts":1700000000500,"type":"snapshot","data":{"symbol":"BTCUSDT","lastPrice":"100.5"}}"#,
        )
        .unwrap();
        let t = parse_tickers(&msg).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].seq, 1700000000500);
        assert_eq!(t[0].price, 100.5);

        let msg: WsMessage = serde_json::from_str(
            r#"{"topic":"tickers.BTCUSDT","ts":5,"data":[{"symbol":"BTCUSDT","lastPrice":"1","ts":3},{"symbol":"BTCUSDT","lastPrice":"2","seq":9}]}"#,
        )
        .unwrap();
        let seqs: Vec<i64> = parse_tickers(&msg).unwrap().iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![3, 9]);
    }

    #[test]
    fn private_topics_map_to_domain() {
        let msg: WsMessage = serde_json::from_str(
            r#"{"topic":"order","data":[{"orderId":"9","orderLinkId":"abc-tp","symbol":"BTCUSDT","side":"Sell",
                "orderType":"Limit","price":"101","qty":"2","leavesQty":"0.5","orderStatus":"PartiallyFilled","seq":12}]}"#,
        )
        .unwrap();
        let o = &parse_orders(&msg).unwrap()[0];
        assert_eq!(o.kind, crate::domain::OrderKind::TakeProfit);
        assert_eq!(o.filled_qty, 1.5);
        assert_eq!(o.status, OrderStatus::PartiallyFilled);

        let msg: WsMessage = serde_json::from_str(
            r#"{"topic":"execution","data":[{"orderId":"9","orderLinkId":"abc-so-1","execId":"x1","symbol":"BTCUSDT",
                "side":"Buy","execPrice":"95","execQty":"0.2","execTime":"1700000000000","seq":4}]}"#,
        )
        .unwrap();
        let f = &parse_executions(&msg).unwrap()[0];
        assert_eq!((f.price, f.qty, f.seq), (95.0, 0.2, 4));
        assert_eq!(f.side, Side::Buy);
    }

    #[test]
    fn wallet_balance_fallbacks() {
        let c = CoinBalance { coin: "BTC".into(), wallet_balance: "1.5".into(), ..Default::default() };
        assert_eq!(c.to_balance(), Balance { wallet: 1.5, available: 1.5 });
        let c = CoinBalance {
            coin: "BTC".into(),
            wallet_balance: "1.5".into(),
            available_to_withdraw: "".into(),
            available_balance: "1.2".into(),
        };
        assert_eq!(c.to_balance().available, 1.2);
    }
}
