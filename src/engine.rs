// ===============================
// src/engine.rs
// ===============================
//
// Orchestrator: owns instrument rules, the deal state lock and the
// background tasks. Behaviour is split across orders / lifecycle /
// events / tp / restore, each an `impl Engine` block.
//

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::calc::{is_qty_zero, round_down};
use crate::config::BotConfig;
use crate::deal::DealState;
use crate::domain::{Fill, InstrumentRules, Order};
use crate::error::{EngineError, EngineResult, ExchangeResult};
use crate::exchange::ExchangeClient;
use crate::metrics;
use crate::retry::RetryPolicy;

pub(crate) struct Shared {
    pub deal: DealState,
    /// Due time of the pending TP rebuild.
    pub tp_rebuild_at: Instant,
    pub tp_rebuild_scheduled: bool,
    pub last_ticker_log: Option<Instant>,
}

pub struct Engine {
    pub(crate) cfg: BotConfig,
    pub(crate) client: Arc<dyn ExchangeClient>,
    pub(crate) rules: InstrumentRules,
    pub(crate) retry: RetryPolicy,
    pub(crate) shutdown: CancellationToken,
    pub(crate) shared: Mutex<Shared>,
    /// Held across a whole TP cancel/place so at most one TP is ever in flight.
    pub(crate) tp_lock: Mutex<()>,
    tp_seq: AtomicU64,
}

impl Engine {
    /// Fetch instrument rules (fatal once retries are exhausted) and build the engine.
    pub async fn new(cfg: BotConfig, client: Arc<dyn ExchangeClient>, shutdown: CancellationToken) -> EngineResult<Arc<Self>> {
        let retry = RetryPolicy::default();
        let rules = {
            let c = client.clone();
            let symbol = cfg.symbol.clone();
            retry
                .run(&shutdown, "get_instrument_rules", || {
                    let c = c.clone();
                    let symbol = symbol.clone();
                    async move { c.get_instrument_rules(&symbol).await }
                })
                .await?
        };
        info!(
            symbol = %cfg.symbol,
            tick = rules.tick_size,
            lot = rules.lot_size,
            min_qty = rules.min_qty,
            min_notional = rules.min_notional,
            base = %rules.base_coin,
            quote = %rules.quote_coin,
            "instrument rules loaded"
        );
        let deal = DealState::new(&cfg.symbol, cfg.side);
        Ok(Arc::new(Self {
            cfg,
            client,
            rules,
            retry,
            shutdown,
            shared: Mutex::new(Shared { deal, tp_rebuild_at: Instant::now(), tp_rebuild_scheduled: false, last_ticker_log: None }),
            tp_lock: Mutex::new(()),
            tp_seq: AtomicU64::new(0),
        }))
    }

    /// subscribe -> dispatcher -> restore -> open. Returns when the stream ends or on shutdown.
    pub async fn run(self: &Arc<Self>, restore_on_start: bool) -> EngineResult<()> {
        let events = {
            let c = self.client.clone();
            let symbol = self.cfg.symbol.clone();
            self.retry
                .run(&self.shutdown, "subscribe", || {
                    let c = c.clone();
                    let symbol = symbol.clone();
                    async move { c.subscribe(&symbol).await }
                })
                .await?
        };
        let dispatcher = tokio::spawn({
            let e = self.clone();
            async move { e.dispatch(events).await }
        });

        let restored = if restore_on_start { self.restore().await? } else { false };
        if !restored {
            self.open_deal().await?;
        }

        match dispatcher.await {
            Ok(res) => res,
            Err(e) => {
                error!(?e, "dispatcher task failed");
                Err(EngineError::StreamClosed)
            }
        }
    }

    /// Copy of the current deal state.
    pub async fn snapshot(&self) -> DealState { self.shared.lock().await.deal.clone() }

    pub(crate) async fn state(&self) -> MutexGuard<'_, Shared> { self.shared.lock().await }

    pub(crate) fn round_price(&self, price: f64) -> f64 { round_down(price, self.rules.tick_size) }
    pub(crate) fn round_qty(&self, qty: f64) -> f64 { round_down(qty, self.rules.lot_size) }
    pub(crate) fn is_qty_zero(&self, qty: f64) -> bool { is_qty_zero(qty, self.rules.lot_size) }

    pub(crate) fn next_tp_link(&self, deal_id: &str) -> String {
        let n = self.tp_seq.fetch_add(1, Ordering::Relaxed) + 1;
        crate::linkid::take_profit(deal_id, chrono::Utc::now().timestamp(), n)
    }

    /// Cancellable sleep; `Err(Cancelled)` on shutdown.
    pub(crate) async fn pause(&self, d: Duration) -> EngineResult<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(EngineError::Cancelled),
            _ = sleep(d) => Ok(()),
        }
    }

    pub(crate) async fn open_orders(&self) -> ExchangeResult<Vec<Order>> {
        let c = self.client.clone();
        let symbol = self.cfg.symbol.as_str();
        self.retry.run(&self.shutdown, "get_open_orders", || c.get_open_orders(symbol)).await
    }

    pub(crate) async fn fills(&self) -> ExchangeResult<Vec<Fill>> {
        let c = self.client.clone();
        let symbol = self.cfg.symbol.as_str();
        self.retry.run(&self.shutdown, "get_fills", || c.get_fills(symbol)).await
    }

    /// Base-coin balance (wallet, else available). Zero when the base coin is unknown.
    pub(crate) async fn base_balance(&self) -> ExchangeResult<f64> {
        let base = &self.rules.base_coin;
        if base.is_empty() {
            return Ok(0.0);
        }
        let c = self.client.clone();
        let coins = std::slice::from_ref(base);
        let balances = self.retry.run(&self.shutdown, "get_balances", || c.get_balances(coins)).await?;
        Ok(balances.get(base).map(|b| b.effective()).unwrap_or(0.0))
    }

    pub(crate) fn publish_gauges(deal: &DealState) {
        metrics::DEAL_ACTIVE.set(deal.active as i64);
        metrics::POSITION_QTY.set(deal.total_qty);
        metrics::POSITION_AVG_PRICE.set(deal.avg_price);
    }
}
