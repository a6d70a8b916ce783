// ===============================
// src/lifecycle.rs
// ===============================
//
// Idle -> Active (open_deal), Active -> Closing (request_close),
// Closing -> Idle (finalize_close) or back to Active (abort).
//

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::calc::{avg_price, tp_price};
use crate::deal::EntryFill;
use crate::domain::{Order, OrderKind, OrderType, QtyUnit, Side};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::linkid;
use crate::metrics;
use crate::risk;

const TICKER_WAIT: Duration = Duration::from_secs(10);
const TICKER_POLL: Duration = Duration::from_millis(300);
const ENTRY_FILL_TIMEOUT: Duration = Duration::from_secs(20);
const ENTRY_FILL_POLL: Duration = Duration::from_secs(1);
const CLOSE_SETTLE: Duration = Duration::from_secs(1);
const RESTART_DELAY: Duration = Duration::from_secs(1);
const RESTART_CHECKS: usize = 5;

impl Engine {
    /// Start a fresh cycle: market entry, wait for its fill, then TP and grid.
    pub async fn open_deal(&self) -> EngineResult<()> {
        let price_hint = {
            let st = self.state().await;
            if st.deal.active {
                return Ok(());
            }
            st.deal.last_price()
        };
        let deal_id = linkid::new_deal_id();
        let link_id = linkid::entry(&deal_id);
        let side = self.cfg.side;
        let unit = self.cfg.qty_unit;

        let qty = match unit {
            QtyUnit::QuoteCoin => self.cfg.base_order_qty,
            QtyUnit::BaseCoin => self.round_qty(self.cfg.base_order_qty),
        };
        let mut entry = Order::request(&self.cfg.symbol, side, OrderType::Market, OrderKind::Entry, 0.0, qty, link_id.clone());
        entry.market_unit = Some(unit);
        if unit == QtyUnit::BaseCoin {
            entry.qty_step = self.rules.lot_size;
            risk::check_min_qty(qty, &self.rules)?;
        }

        let mut price_hint = price_hint;
        if price_hint <= 0.0 && self.rules.min_notional > 0.0 {
            price_hint = self.wait_for_ticker_price(TICKER_WAIT).await?;
        }
        risk::check_min_notional(&entry, price_hint, &self.rules)?;

        info!(deal_id = %deal_id, side = side.as_str(), qty, unit = unit.as_str(), "opening deal, submitting entry");
        self.place_order_idempotent(&entry).await?;

        let (price, filled, exec_ids) = self.wait_entry_fill(&link_id).await?;
        {
            let mut st = self.state().await;
            st.deal.side = side;
            st.deal.begin(
                EntryFill { deal_id: deal_id.clone(), link_id: link_id.clone(), price, qty: filled, exec_ids },
                Instant::now(),
            );
            Engine::publish_gauges(&st.deal);
        }
        metrics::DEALS_OPENED.inc();
        info!(deal_id = %deal_id, link_id = %link_id, price, qty = filled, "entry filled, deal active");

        self.place_tp_and_safety(price).await
    }

    pub(crate) async fn wait_for_ticker_price(&self, timeout: Duration) -> EngineResult<f64> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let price = self.state().await.deal.last_price();
            if price > 0.0 {
                return Ok(price);
            }
            self.pause(TICKER_POLL).await?;
        }
        Err(EngineError::NoTickerPrice)
    }

    /// Poll fill history for the entry link; returns the weighted average
    /// price, total qty and exec ids seen.
    async fn wait_entry_fill(&self, link_id: &str) -> EngineResult<(f64, f64, Vec<String>)> {
        let deadline = Instant::now() + ENTRY_FILL_TIMEOUT;
        loop {
            self.pause(ENTRY_FILL_POLL).await?;
            if Instant::now() >= deadline {
                return Err(EngineError::EntryFillTimeout(link_id.to_string()));
            }
            let fills = match self.fills().await {
                Ok(f) => f,
                Err(e) => {
                    warn!(link_id, error = %e, "entry fill poll failed");
                    continue;
                }
            };
            let (mut qty, mut cost) = (0.0, 0.0);
            let mut exec_ids = Vec::new();
            for f in fills.iter().filter(|f| f.link_id == link_id) {
                qty += f.qty;
                cost += f.price * f.qty;
                if !f.exec_id.is_empty() {
                    exec_ids.push(f.exec_id.clone());
                }
            }
            if qty > 0.0 {
                return Ok((avg_price(cost, qty), qty, exec_ids));
            }
        }
    }

    async fn place_tp_and_safety(&self, entry_price: f64) -> EngineResult<()> {
        let (side, total) = {
            let st = self.state().await;
            (st.deal.side, st.deal.total_qty)
        };
        let price = self.round_price(tp_price(entry_price, self.cfg.tp_percent, side));
        self.place_tp(price, self.round_qty(total)).await?;
        self.place_safety_orders(entry_price).await?;
        Ok(())
    }

    /// Active -> Closing; the supervisor runs in the background.
    pub(crate) async fn request_close(self: &Arc<Self>, reason: &str) {
        {
            let mut st = self.state().await;
            if !st.deal.begin_close(reason) {
                return;
            }
            info!(deal_id = %st.deal.deal_id, reason, "closing deal");
        }
        let e = self.clone();
        tokio::spawn(async move { e.supervise_close().await });
    }

    async fn supervise_close(self: Arc<Self>) {
        if self.state().await.deal.closing {
            match self.cancel_safety_orders().await {
                Ok(()) => info!("safety orders cancelled"),
                Err(e) => warn!(error = %e, "cancelling safety orders failed"),
            }
        }

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let (active, closing, total, last_fill_at, side) = {
                let st = self.state().await;
                (st.deal.active, st.deal.closing, st.deal.total_qty, st.deal.last_fill_at, st.deal.side)
            };
            if !active || !closing {
                return;
            }

            if !self.is_qty_zero(total) {
                warn!(total_qty = total, "close aborted, position still open");
                self.abort_close(None).await;
                return;
            }
            if side == Side::Buy {
                match self.base_balance().await {
                    Ok(balance) => {
                        let rounded = self.round_qty(balance);
                        if !self.is_qty_zero(rounded) {
                            warn!(balance = rounded, "close aborted, base balance still open");
                            self.abort_close(Some(rounded)).await;
                            return;
                        }
                    }
                    // unknown is not flat
                    Err(e) => {
                        warn!(error = %e, "balance check during close failed, retrying");
                        if self.pause(CLOSE_SETTLE).await.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            if let Some(t) = last_fill_at {
                if t.elapsed() < CLOSE_SETTLE {
                    if self.pause(CLOSE_SETTLE).await.is_err() {
                        return;
                    }
                    continue;
                }
            }

            match self.open_bot_orders().await {
                Err(e) => warn!(error = %e, "open order check before finalize failed"),
                Ok(open) if open.is_empty() => {
                    self.finalize_close().await;
                    return;
                }
                Ok(open) => {
                    info!(count = open.len(), "waiting for open orders to cancel before finalize");
                    if let Err(e) = self.cancel_open_bot_orders().await {
                        warn!(error = %e, "cancelling leftover orders failed");
                    }
                }
            }
            if self.pause(CLOSE_SETTLE).await.is_err() {
                return;
            }
        }
    }

    /// Closing -> Active, optionally resyncing the position size from balance.
    async fn abort_close(&self, qty: Option<f64>) {
        {
            let mut st = self.state().await;
            if !st.deal.closing {
                return;
            }
            if let Some(q) = qty {
                st.deal.total_qty = q;
            }
            st.deal.abort_close();
            Engine::publish_gauges(&st.deal);
        }
        metrics::CLOSE_ABORTS.inc();
        if let Err(e) = self.rebuild_tp().await {
            warn!(error = %e, "take-profit rebuild after close abort failed");
        }
    }

    async fn finalize_close(self: &Arc<Self>) {
        let deal_id = {
            let mut st = self.state().await;
            let id = st.deal.deal_id.clone();
            if !st.deal.reset() {
                return;
            }
            Engine::publish_gauges(&st.deal);
            id
        };
        metrics::DEALS_CLOSED.inc();
        info!(deal_id = %deal_id, "deal finalized");
        let e = self.clone();
        tokio::spawn(async move { e.restart_after_close().await });
    }

    /// Open the next cycle only once no tagged orders remain and the
    /// base balance is flat; otherwise stay idle.
    async fn restart_after_close(self: Arc<Self>) {
        if self.pause(RESTART_DELAY).await.is_err() {
            return;
        }
        let mut orders_clear = false;
        for _ in 0..RESTART_CHECKS {
            match self.open_bot_orders().await {
                Err(e) => warn!(error = %e, "open order check before restart failed"),
                Ok(open) if open.is_empty() => {
                    orders_clear = true;
                    break;
                }
                Ok(open) => {
                    info!(count = open.len(), "cancelling leftover orders before restart");
                    if let Err(e) = self.cancel_open_bot_orders().await {
                        warn!(error = %e, "cancelling leftover orders failed");
                    }
                }
            }
            if self.pause(RESTART_DELAY).await.is_err() {
                return;
            }
        }
        if !orders_clear {
            warn!("new deal not started, bot orders still open");
            return;
        }
        if self.cfg.side == Side::Buy {
            match self.base_balance().await {
                Ok(b) if !self.is_qty_zero(self.round_qty(b)) => {
                    warn!(balance = b, "new deal not started, base balance not flat");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "new deal not started, balance check failed");
                    return;
                }
            }
        }
        if let Err(e) = self.open_deal().await {
            warn!(error = %e, "opening next deal failed");
        }
    }
}
