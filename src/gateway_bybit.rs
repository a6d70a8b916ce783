// ===============================
// src/gateway_bybit.rs
// ===============================
//
// Bybit v5 spot client: signed REST over reqwest plus the public/private
// WebSocket streams merged into one event channel.
//

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bybit::{
    classify, format_with_step, sign_rest, timestamp_ms, ApiResponse, CreateOrderResult, Empty, ExecutionItem,
    InstrumentItem, ListResult, OrderItem, WalletAccount,
};
use crate::domain::{Balance, Event, Fill, InstrumentRules, Order, OrderType, QtyUnit};
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::ExchangeClient;
use crate::feed::{run_bybit_stream, StreamSpec};

const CATEGORY: &str = "spot";
const EVENT_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct BybitConfig {
    pub rest_url: String,
    pub ws_public_url: String,
    pub ws_private_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub account_type: String,
    pub recv_window: u64,
}

pub struct BybitClient {
    cfg: BybitConfig,
    http: reqwest::Client,
    shutdown: CancellationToken,
}

impl BybitClient {
    pub fn new(cfg: BybitConfig, shutdown: CancellationToken) -> ExchangeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        Ok(Self { cfg, http, shutdown })
    }

    fn url(&self, path: &str) -> String { format!("{}{}", self.cfg.rest_url.trim_end_matches('/'), path) }

    fn query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn signed(&self, req: reqwest::RequestBuilder, payload: &str) -> reqwest::RequestBuilder {
        let ts = timestamp_ms();
        let sig = sign_rest(&self.cfg.api_secret, ts, &self.cfg.api_key, self.cfg.recv_window, payload);
        req.header("X-BAPI-API-KEY", &self.cfg.api_key)
            .header("X-BAPI-SIGN", sig)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.cfg.recv_window.to_string())
    }

    async fn decode<T: DeserializeOwned + Default>(rsp: reqwest::Response) -> ExchangeResult<T> {
        let status = rsp.status().as_u16();
        let body = rsp.text().await?;
        match serde_json::from_str::<ApiResponse<T>>(&body) {
            Ok(env) => env.into_result(status),
            Err(_) if status >= 400 => Err(classify(0, &body, status)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_public<T: DeserializeOwned + Default>(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<T> {
        let url = format!("{}?{}", self.url(path), Self::query(params));
        let rsp = self.http.get(url).send().await?;
        Self::decode(rsp).await
    }

    async fn get_signed<T: DeserializeOwned + Default>(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<T> {
        let query = Self::query(params);
        let req = self.http.get(format!("{}?{}", self.url(path), query));
        let rsp = self.signed(req, &query).send().await?;
        Self::decode(rsp).await
    }

    async fn post_signed<T: DeserializeOwned + Default>(&self, path: &str, body: Value) -> ExchangeResult<T> {
        let body = body.to_string();
        let req = self.http.post(self.url(path)).header("Content-Type", "application/json");
        let rsp = self.signed(req, &body).body(body).send().await?;
        Self::decode(rsp).await
    }
}

/// JSON body for `/v5/order/create`.
pub fn order_body(order: &Order) -> Value {
    let mut m = Map::new();
    m.insert("category".into(), json!(CATEGORY));
    m.insert("symbol".into(), json!(order.symbol));
    m.insert("side".into(), json!(order.side.as_str()));
    m.insert("orderType".into(), json!(order.order_type.as_str()));
    m.insert("qty".into(), json!(format_with_step(order.qty, order.qty_step)));
    m.insert("orderLinkId".into(), json!(order.link_id));
    match order.order_type {
        OrderType::Market => {
            let unit = order.market_unit.unwrap_or(QtyUnit::BaseCoin);
            m.insert("marketUnit".into(), json!(unit.as_str()));
        }
        OrderType::Limit => {
            m.insert("price".into(), json!(format_with_step(order.price, order.price_step)));
            m.insert("timeInForce".into(), json!(order.time_in_force));
        }
    }
    Value::Object(m)
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn get_instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules> {
        let res: ListResult<InstrumentItem> = self
            .get_public("/v5/market/instruments-info", &[("category", CATEGORY.into()), ("symbol", symbol.into())])
            .await?;
        let item = res.list.into_iter().next().ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
        item.into_rules()
    }

    async fn subscribe(&self, symbol: &str) -> ExchangeResult<mpsc::Receiver<Event>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let public = StreamSpec {
            name: "public",
            url: self.cfg.ws_public_url.clone(),
            auth: None,
            topics: vec![format!("tickers.{symbol}")],
            symbol: symbol.to_string(),
        };
        let private = StreamSpec {
            name: "private",
            url: self.cfg.ws_private_url.clone(),
            auth: Some((self.cfg.api_key.clone(), self.cfg.api_secret.clone())),
            topics: vec!["order".into(), "execution".into()],
            symbol: symbol.to_string(),
        };
        for spec in [public, private] {
            let (tx, token) = (tx.clone(), self.shutdown.clone());
            tokio::spawn(async move { run_bybit_stream(spec, tx, token).await });
        }
        info!(symbol, "bybit streams started");
        Ok(rx)
    }

    async fn place_order(&self, order: &Order) -> ExchangeResult<Order> {
        let body = order_body(order);
        debug!(%body, "order/create");
        let res: CreateOrderResult = self.post_signed("/v5/order/create", body).await?;
        let mut placed = order.clone();
        placed.id = res.order_id;
        if !res.order_link_id.is_empty() {
            placed.link_id = res.order_link_id;
        }
        Ok(placed)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let body = json!({ "category": CATEGORY, "symbol": symbol, "orderId": order_id });
        let _: Empty = self.post_signed("/v5/order/cancel", body).await?;
        Ok(())
    }

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<Order>> {
        let res: ListResult<OrderItem> = self
            .get_signed(
                "/v5/order/realtime",
                &[("category", CATEGORY.into()), ("symbol", symbol.into()), ("openOnly", "0".into()), ("limit", "50".into())],
            )
            .await?;
        Ok(res.list.into_iter().map(|o| o.into_order(symbol)).collect())
    }

    async fn get_fills(&self, symbol: &str) -> ExchangeResult<Vec<Fill>> {
        let res: ListResult<ExecutionItem> = self
            .get_signed("/v5/execution/list", &[("category", CATEGORY.into()), ("symbol", symbol.into()), ("limit", "100".into())])
            .await?;
        Ok(res.list.into_iter().map(|e| e.into_fill(symbol)).collect())
    }

    async fn get_balances(&self, coins: &[String]) -> ExchangeResult<HashMap<String, Balance>> {
        let res: ListResult<WalletAccount> = self
            .get_signed(
                "/v5/account/wallet-balance",
                &[("accountType", self.cfg.account_type.clone()), ("coin", coins.join(","))],
            )
            .await?;
        let mut out = HashMap::new();
        for acct in res.list {
            for c in acct.coin {
                if coins.iter().any(|w| w == &c.coin) {
                    out.insert(c.coin.clone(), c.to_balance());
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, Side};

    #[test]
    fn limit_body_uses_steps() {
        let mut o = Order::request("BTCUSDT", Side::Sell, OrderType::Limit, OrderKind::TakeProfit, 101.239, 0.0123456, "d-tp-1-1".into());
        o.price_step = 0.01;
        o.qty_step = 0.0001;
        let b = order_body(&o);
        assert_eq!(b["price"], "101.23");
        assert_eq!(b["qty"], "0.0123");
        assert_eq!(b["timeInForce"], "GTC");
        assert_eq!(b["orderLinkId"], "d-tp-1-1");
        assert!(b.get("marketUnit").is_none());
    }

    #[test]
    fn market_body_carries_unit() {
        let mut o = Order::request("BTCUSDT", Side::Buy, OrderType::Market, OrderKind::Entry, 0.0, 25.0, "d-entry".into());
        o.market_unit = Some(QtyUnit::QuoteCoin);
        let b = order_body(&o);
        assert_eq!(b["marketUnit"], "quoteCoin");
        assert_eq!(b["qty"], "25");
        assert!(b.get("price").is_none());
    }

    #[test]
    fn query_is_url_encoded() {
        let q = BybitClient::query(&[("coin", "BTC,USDT".into()), ("category", "spot".into())]);
        assert_eq!(q, "coin=BTC%2CUSDT&category=spot");
    }
}
