// ===============================
// src/exchange.rs
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{Balance, Event, Fill, InstrumentRules, Order};
use crate::error::ExchangeResult;

/// Venue capability consumed by the engine. Implementations must be safe
/// to call concurrently; connection pooling is their business.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules>;

    /// Merged at-least-once stream of ticker / order / fill events.
    /// A `Reconnect` is emitted after any re-connection once subscriptions are restored.
    async fn subscribe(&self, symbol: &str) -> ExchangeResult<mpsc::Receiver<Event>>;

    async fn place_order(&self, order: &Order) -> ExchangeResult<Order>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;
    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<Order>>;
    async fn get_fills(&self, symbol: &str) -> ExchangeResult<Vec<Fill>>;
    async fn get_balances(&self, coins: &[String]) -> ExchangeResult<HashMap<String, Balance>>;
}
