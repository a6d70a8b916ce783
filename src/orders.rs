// ===============================
// src/orders.rs
// ===============================
//
// Order execution: link-id idempotent placement, grid placement and
// bounded-parallel cancellation.
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::calc::safety_grid;
use crate::domain::{Order, OrderKind, OrderType, QtyUnit, Side};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, ExchangeError};
use crate::linkid;
use crate::metrics;
use crate::risk;

const CANCEL_WORKERS: usize = 3;
const DUPLICATE_LOOKUPS: usize = 3;
const DUPLICATE_LOOKUP_DELAY: Duration = Duration::from_millis(300);
const GRID_PACING: Duration = Duration::from_millis(200);

impl Engine {
    /// Submit an order at most once per link id.
    pub async fn place_order_idempotent(&self, order: &Order) -> EngineResult<Order> {
        if order.link_id.is_empty() {
            return Err(EngineError::MissingLinkId);
        }
        if order.order_type != OrderType::Market {
            if let Ok(Some(existing)) = self.find_open_order_by_link(&order.link_id).await {
                info!(link_id = %order.link_id, order_id = %existing.id, "order already open, not resubmitting");
                return Ok(existing);
            }
        }

        self.log_order_context(order).await;
        let c = self.client.clone();
        let err = match self.retry.run(&self.shutdown, "place_order", || c.place_order(order)).await {
            Ok(placed) => {
                metrics::ORDERS_PLACED.with_label_values(&[kind_label(order.kind)]).inc();
                return Ok(placed);
            }
            Err(e) => e,
        };

        if err.is_duplicate() {
            if let Some(existing) = self.find_order_after_duplicate(&order.link_id).await {
                debug!(link_id = %order.link_id, order_id = %existing.id, "resolved duplicate submission");
                return Ok(existing);
            }
        }
        if order.order_type == OrderType::Market {
            if let Ok(fills) = self.fills().await {
                if let Some(f) = fills.iter().find(|f| f.link_id == order.link_id) {
                    info!(link_id = %order.link_id, order_id = %f.order_id, "market order already executed");
                    let mut synth = order.clone();
                    synth.id = f.order_id.clone();
                    return Ok(synth);
                }
            }
        }
        Err(err.into())
    }

    pub(crate) async fn find_open_order_by_link(&self, link_id: &str) -> EngineResult<Option<Order>> {
        let orders = self.open_orders().await?;
        Ok(orders.into_iter().find(|o| o.link_id == link_id && !o.id.is_empty()))
    }

    async fn find_order_after_duplicate(&self, link_id: &str) -> Option<Order> {
        for i in 0..DUPLICATE_LOOKUPS {
            if let Ok(Some(o)) = self.find_open_order_by_link(link_id).await {
                return Some(o);
            }
            if i + 1 < DUPLICATE_LOOKUPS && self.pause(DUPLICATE_LOOKUP_DELAY).await.is_err() {
                return None;
            }
        }
        None
    }

    /// Cancel in parallel with a small worker pool. Not-found counts as done;
    /// the first real error is returned after in-flight cancels finish.
    pub async fn cancel_many(&self, order_ids: Vec<String>) -> EngineResult<usize> {
        let n = order_ids.len();
        if n == 0 {
            return Ok(0);
        }
        let symbol = self.cfg.symbol.as_str();
        let failed = AtomicBool::new(false);
        let failed = &failed;
        let results: Vec<Result<(), ExchangeError>> = stream::iter(order_ids)
            .map(|id| {
                let c = self.client.clone();
                async move {
                    if self.shutdown.is_cancelled() {
                        return Err(ExchangeError::Cancelled);
                    }
                    if failed.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    let res = self.retry.run(&self.shutdown, "cancel_order", || c.cancel_order(symbol, &id)).await;
                    match res {
                        Ok(()) => {
                            metrics::ORDER_CANCELS.inc();
                            Ok(())
                        }
                        Err(e) if e.is_not_found() => {
                            debug!(order_id = %id, "cancel: order already gone");
                            Ok(())
                        }
                        Err(e) => {
                            failed.store(true, Ordering::Relaxed);
                            Err(e)
                        }
                    }
                }
            })
            .buffer_unordered(CANCEL_WORKERS)
            .collect()
            .await;
        match results.into_iter().find_map(|r| r.err()) {
            Some(e) => Err(e.into()),
            None => Ok(n),
        }
    }

    pub(crate) async fn cancel_safety_orders(&self) -> EngineResult<()> {
        let ids: Vec<String> = {
            let st = self.state().await;
            st.deal.safety_orders.values().filter(|id| !id.is_empty()).cloned().collect()
        };
        if ids.is_empty() {
            return Ok(());
        }
        self.cancel_many(ids).await?;
        self.state().await.deal.safety_orders.clear();
        Ok(())
    }

    /// Anything open whose link id carries a deal id is ours.
    pub(crate) async fn open_bot_orders(&self) -> EngineResult<Vec<Order>> {
        let orders = self.open_orders().await?;
        Ok(orders.into_iter().filter(|o| linkid::deal_id_of(&o.link_id).is_some()).collect())
    }

    pub(crate) async fn cancel_open_bot_orders(&self) -> EngineResult<usize> {
        let ids: Vec<String> = self.open_bot_orders().await?.into_iter().filter(|o| !o.id.is_empty()).map(|o| o.id).collect();
        self.cancel_many(ids).await
    }

    /// Planned grid legs for the current deal, rounded to instrument steps.
    pub(crate) fn planned_grid(&self, deal_id: &str, side: Side, entry_price: f64) -> Vec<Order> {
        let c = &self.cfg;
        safety_grid(entry_price, c.so_count, c.so_step_percent, c.so_step_multiplier, c.so_base_qty, c.so_qty_multiplier, side)
            .into_iter()
            .filter_map(|lvl| {
                let price = self.round_price(lvl.price);
                let mut qty = lvl.qty;
                if c.qty_unit == QtyUnit::QuoteCoin {
                    if price <= 0.0 {
                        warn!(index = lvl.index, cum_percent = lvl.cum_percent, "safety leg skipped, no price to convert quote qty");
                        return None;
                    }
                    qty /= price;
                }
                qty = self.round_qty(qty);
                debug!(index = lvl.index, price, qty, notional = price * qty, cum_percent = lvl.cum_percent, "safety leg plan");
                Some(self.limit_order(side, OrderKind::Safety, price, qty, linkid::safety(deal_id, lvl.index)))
            })
            .collect()
    }

    pub(crate) fn limit_order(&self, side: Side, kind: OrderKind, price: f64, qty: f64, link_id: String) -> Order {
        let mut o = Order::request(&self.cfg.symbol, side, OrderType::Limit, kind, price, qty, link_id);
        o.price_step = self.rules.tick_size;
        o.qty_step = self.rules.lot_size;
        o
    }

    /// Place every grid leg not already registered, open, or filled.
    /// Legs below exchange minimums are skipped with a warning.
    pub(crate) async fn place_safety_orders(&self, entry_price: f64) -> EngineResult<usize> {
        let (deal_id, side) = {
            let st = self.state().await;
            if !st.deal.active {
                return Ok(0);
            }
            (st.deal.deal_id.clone(), st.deal.side)
        };
        if entry_price <= 0.0 {
            return Ok(0);
        }
        let plan = self.planned_grid(&deal_id, side, entry_price);
        info!(deal_id = %deal_id, count = plan.len(), "safety grid plan");

        let open = self.open_orders().await.unwrap_or_default();
        let mut placed = 0usize;
        let last = plan.len().saturating_sub(1);
        for (i, leg) in plan.into_iter().enumerate() {
            {
                let st = self.state().await;
                if !st.deal.active || st.deal.closing || st.deal.deal_id != deal_id {
                    return Ok(placed);
                }
                if st.deal.safety_orders.get(&leg.link_id).map(|id| !id.is_empty()).unwrap_or(false) {
                    debug!(link_id = %leg.link_id, "safety leg already registered");
                    continue;
                }
                if st.deal.filled_by_link.get(&leg.link_id).copied().unwrap_or(0.0) > 0.0 {
                    debug!(link_id = %leg.link_id, "safety leg already filled");
                    continue;
                }
            }
            if let Some(existing) = open.iter().find(|o| o.link_id == leg.link_id) {
                info!(link_id = %leg.link_id, order_id = %existing.id, "safety leg already open, relinking");
                self.state().await.deal.safety_orders.insert(leg.link_id.clone(), existing.id.clone());
                continue;
            }
            if let Err(e) = risk::check_min_qty(leg.qty, &self.rules) {
                warn!(link_id = %leg.link_id, error = %e, "safety leg skipped");
                continue;
            }
            if let Err(e) = risk::check_min_notional(&leg, leg.price, &self.rules) {
                warn!(link_id = %leg.link_id, error = %e, "safety leg skipped");
                continue;
            }

            info!(link_id = %leg.link_id, price = leg.price, qty = leg.qty, "placing safety order");
            let order = self.place_order_idempotent(&leg).await?;
            self.state().await.deal.safety_orders.insert(leg.link_id.clone(), order.id.clone());
            info!(link_id = %leg.link_id, order_id = %order.id, "safety order placed");
            placed += 1;

            if i < last {
                self.pause(GRID_PACING).await?;
            }
        }
        Ok(placed)
    }

    /// Re-place grid legs the exchange no longer shows, planned from the entry price.
    pub(crate) async fn rebuild_missing_safety_orders(&self) -> EngineResult<usize> {
        let entry_price = self.state().await.deal.entry_price;
        self.place_safety_orders(entry_price).await
    }

    /// Best-effort pre-submission log with the balances the order needs.
    async fn log_order_context(&self, order: &Order) {
        let base = &self.rules.base_coin;
        let quote = &self.rules.quote_coin;
        let unit = order.market_unit.map(|u| u.as_str()).unwrap_or("");
        if base.is_empty() || quote.is_empty() {
            info!(side = order.side.as_str(), kind = order.order_type.as_str(), qty = order.qty, price = order.price, unit, "submitting order");
            return;
        }
        let balances = match self.client.get_balances(&[base.clone(), quote.clone()]).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "balance lookup before order failed");
                info!(side = order.side.as_str(), kind = order.order_type.as_str(), qty = order.qty, price = order.price, unit, "submitting order");
                return;
            }
        };
        let price_hint = if order.price > 0.0 { order.price } else { self.state().await.deal.last_price() };
        let (need_base, need_quote) = match order.side {
            Side::Buy if order.market_unit == Some(QtyUnit::QuoteCoin) => (0.0, order.qty),
            Side::Buy => (0.0, order.qty * price_hint),
            Side::Sell => (order.qty, 0.0),
        };
        info!(
            side = order.side.as_str(),
            kind = order.order_type.as_str(),
            qty = order.qty,
            price = order.price,
            unit,
            need_base,
            need_quote,
            bal_base = balances.get(base).map(|b| b.available).unwrap_or(0.0),
            bal_quote = balances.get(quote).map(|b| b.available).unwrap_or(0.0),
            "submitting order"
        );
    }
}

fn kind_label(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Entry => "entry",
        OrderKind::TakeProfit => "tp",
        OrderKind::Safety => "safety",
        OrderKind::Other => "other",
    }
}
