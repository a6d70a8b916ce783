// ===============================
// src/events.rs
// ===============================
//
// Single dispatcher over the merged stream. State mutation happens under
// the lock inside DealState; follow-up actions run after it is released.
//

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deal::{FillOutcome, OrderOutcome};
use crate::domain::{Event, Fill, Order, OrderKind, Ticker};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::linkid;
use crate::metrics;

const TICKER_LOG_EVERY: Duration = Duration::from_secs(1);

impl Engine {
    pub(crate) async fn dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) -> EngineResult<()> {
        loop {
            let ev = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("dispatcher stopping");
                    return Ok(());
                }
                ev = rx.recv() => ev,
            };
            match ev {
                Some(ev) => self.handle_event(ev).await,
                None => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!("event stream closed");
                    return Err(EngineError::StreamClosed);
                }
            }
        }
    }

    /// Apply one stream event. Public so callers can inject events directly.
    pub async fn handle_event(self: &Arc<Self>, ev: Event) {
        metrics::EVENTS.with_label_values(&[ev.kind()]).inc();
        match ev {
            Event::Fill(f) => self.handle_fill(f).await,
            Event::Order(o) => self.handle_order(o).await,
            Event::Ticker(t) => self.handle_ticker(t).await,
            Event::Reconnect => {
                info!("stream reconnected, syncing open orders");
                if let Err(e) = self.sync_open_orders().await {
                    warn!(error = %e, "open order sync after reconnect failed");
                }
            }
        }
    }

    async fn handle_fill(self: &Arc<Self>, f: Fill) {
        let (outcome, deal_id) = {
            let mut st = self.state().await;
            let out = st.deal.apply_fill(&f, self.rules.lot_size, Instant::now());
            Engine::publish_gauges(&st.deal);
            (out, st.deal.deal_id.clone())
        };
        match outcome {
            FillOutcome::Stale => {
                metrics::STALE_EVENTS.with_label_values(&["fill"]).inc();
                debug!(exec_id = %f.exec_id, seq = f.seq, "stale fill dropped");
            }
            FillOutcome::Duplicate => {
                metrics::DUPLICATE_FILLS.inc();
                debug!(exec_id = %f.exec_id, "duplicate fill dropped");
            }
            FillOutcome::Ignored => {
                debug!(link_id = %f.link_id, side = f.side.as_str(), qty = f.qty, "fill not applied to deal");
            }
            FillOutcome::TakeProfit { qty, remaining, flat } => {
                info!(deal_id = %deal_id, link_id = %f.link_id, qty, price = f.price, total_qty = remaining, "take-profit fill");
                if flat {
                    self.request_close("take-profit filled").await;
                } else {
                    info!(total_qty = remaining, "take-profit partially filled");
                }
            }
            FillOutcome::PositionIncrease { qty, total_qty, avg_price, partial, aborted_close } => {
                let role = match linkid::kind_of(&f.link_id) {
                    OrderKind::Entry => "entry",
                    OrderKind::Safety => "safety",
                    _ => "manual",
                };
                info!(deal_id = %deal_id, link_id = %f.link_id, role, qty, price = f.price, total_qty, avg = avg_price, partial, "position increased");
                if aborted_close {
                    metrics::CLOSE_ABORTS.inc();
                    info!(deal_id = %deal_id, "close aborted by new fill");
                }
                self.schedule_tp_rebuild().await;
            }
        }
    }

    async fn handle_order(self: &Arc<Self>, o: Order) {
        let outcome = {
            let mut st = self.state().await;
            let out = st.deal.apply_order_update(&o, self.rules.lot_size);
            Engine::publish_gauges(&st.deal);
            out
        };
        match outcome {
            OrderOutcome::Stale => {
                metrics::STALE_EVENTS.with_label_values(&["order"]).inc();
                debug!(order_id = %o.id, seq = o.seq, "stale order update dropped");
            }
            OrderOutcome::TpCancelled => info!(order_id = %o.id, "take-profit cancelled"),
            OrderOutcome::TpFilled { remaining, flat } => {
                if flat {
                    self.request_close("take-profit filled (order status)").await;
                } else {
                    warn!(order_id = %o.id, total_qty = remaining, "take-profit filled with residual position");
                }
            }
            OrderOutcome::Applied => {
                debug!(order_id = %o.id, link_id = %o.link_id, status = ?o.status, "order update");
            }
        }
    }

    async fn handle_ticker(&self, t: Ticker) {
        let snapshot = {
            let mut st = self.state().await;
            if !st.deal.apply_ticker(&t) {
                metrics::STALE_EVENTS.with_label_values(&["ticker"]).inc();
                return;
            }
            metrics::LAST_PRICE.set(t.price);
            let now = Instant::now();
            if !st.deal.active || st.last_ticker_log.map(|l| now - l < TICKER_LOG_EVERY).unwrap_or(false) {
                return;
            }
            st.last_ticker_log = Some(now);
            (st.deal.deal_id.clone(), st.deal.avg_price, st.deal.total_qty)
        };
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let (deal_id, avg, total_qty) = snapshot;
        let coins = [self.rules.base_coin.clone(), self.rules.quote_coin.clone()];
        let (base, quote) = match self.client.get_balances(&coins).await {
            Ok(b) => (
                b.get(&coins[0]).map(|x| x.effective()).unwrap_or(0.0),
                b.get(&coins[1]).map(|x| x.effective()).unwrap_or(0.0),
            ),
            Err(_) => (0.0, 0.0),
        };
        let pnl_pct = if avg > 0.0 { (t.price - avg) / avg * 100.0 } else { 0.0 };
        debug!(deal_id = %deal_id, price = t.price, avg, total_qty, pnl_pct, bal_base = base, bal_quote = quote, "ticker");
    }

    /// After a reconnect: relink open TP/grid orders and repair whatever
    /// went missing while the stream was down.
    pub(crate) async fn sync_open_orders(&self) -> EngineResult<()> {
        let (tp_link, legs) = {
            let st = self.state().await;
            if !st.deal.active || st.deal.closing {
                return Ok(());
            }
            (st.deal.tp_link_id.clone(), st.deal.safety_orders.keys().cloned().collect::<Vec<_>>())
        };
        let open = self.open_orders().await?;

        let mut tp_found = false;
        let mut missing = Vec::new();
        {
            let mut st = self.state().await;
            if let Some(o) = open.iter().find(|o| !tp_link.is_empty() && o.link_id == tp_link) {
                st.deal.tp_order_id = o.id.clone();
                tp_found = true;
            }
            for leg in legs {
                match open.iter().find(|o| o.link_id == leg) {
                    Some(o) => {
                        st.deal.safety_orders.insert(leg, o.id.clone());
                    }
                    None => missing.push(leg),
                }
            }
        }
        info!(open = open.len(), tp_found, missing = missing.len(), "open orders synced");

        if !tp_found && !tp_link.is_empty() {
            warn!(link_id = %tp_link, "take-profit missing after reconnect, rebuilding");
            self.rebuild_tp().await?;
        }
        if !missing.is_empty() {
            let fills = self.fills().await?;
            let mut st = self.state().await;
            for leg in missing {
                if fills.iter().any(|f| f.link_id == leg) {
                    debug!(link_id = %leg, "safety leg filled while disconnected");
                } else {
                    warn!(link_id = %leg, "safety leg missing, will re-place");
                    st.deal.safety_orders.remove(&leg);
                }
            }
        }
        self.rebuild_missing_safety_orders().await?;
        Ok(())
    }
}
