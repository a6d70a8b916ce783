// ===============================
// src/tp.rs
// ===============================
//
// Take-profit maintenance: debounced rebuild scheduler, single-instance
// placement, and sizing against the settled base balance.
//

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::calc::tp_price;
use crate::domain::{Balance, Order, OrderKind, Side};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, ExchangeError};
use crate::linkid;
use crate::metrics;
use crate::risk;

const REBUILD_DEBOUNCE: Duration = Duration::from_millis(700);
const REBUILD_RETRY: Duration = Duration::from_secs(1);
const CANCEL_SETTLE: Duration = Duration::from_millis(500);
const OPEN_TP_CHECKS: usize = 5;
const OPEN_TP_DELAY: Duration = Duration::from_millis(500);
const FILL_SETTLE: Duration = Duration::from_secs(2);
const BALANCE_POLLS: usize = 8;
const BALANCE_POLL_DELAY: Duration = Duration::from_millis(500);
const BALANCE_RATIO_MIN: f64 = 0.99;

impl Engine {
    /// Coalesce bursts of fills into one rebuild, 700ms after the last trigger.
    pub(crate) async fn schedule_tp_rebuild(self: &Arc<Self>) {
        {
            let mut st = self.state().await;
            if !st.deal.active {
                return;
            }
            st.tp_rebuild_at = Instant::now() + REBUILD_DEBOUNCE;
            if st.tp_rebuild_scheduled {
                return;
            }
            st.tp_rebuild_scheduled = true;
        }
        let e = self.clone();
        tokio::spawn(async move { e.run_tp_rebuilds().await });
    }

    /// Single rebuild loop. Triggers that land while a rebuild runs only push
    /// `tp_rebuild_at`; the loop picks them up once the current rebuild is done.
    async fn run_tp_rebuilds(self: Arc<Self>) {
        loop {
            let due = self.state().await.tp_rebuild_at;
            let now = Instant::now();
            if due > now {
                if self.pause(due - now).await.is_err() {
                    self.state().await.tp_rebuild_scheduled = false;
                    return;
                }
                // pushed back while we slept
                continue;
            }

            let started = Instant::now();
            let failed = match self.rebuild_tp().await {
                Ok(()) => {
                    metrics::TP_REBUILDS.inc();
                    false
                }
                Err(EngineError::Cancelled) | Err(EngineError::Exchange(ExchangeError::Cancelled)) => {
                    self.state().await.tp_rebuild_scheduled = false;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "take-profit rebuild failed, retrying");
                    true
                }
            };

            let mut st = self.state().await;
            if !st.deal.active {
                st.tp_rebuild_scheduled = false;
                return;
            }
            if failed {
                st.tp_rebuild_at = st.tp_rebuild_at.max(Instant::now() + REBUILD_RETRY);
            } else if st.tp_rebuild_at <= started {
                st.tp_rebuild_scheduled = false;
                return;
            } else {
                debug!("fills arrived during take-profit rebuild, rebuilding again");
            }
        }
    }

    /// Cancel the current TP (if any) and place a new one at the average-cost target.
    /// Waits for any TP work already in flight, then sizes from the state at that point.
    pub(crate) async fn rebuild_tp(&self) -> EngineResult<()> {
        let _tp = self.tp_lock.lock().await;
        let (old_id, avg, total, side) = {
            let st = self.state().await;
            if !st.deal.active {
                return Ok(());
            }
            (st.deal.tp_order_id.clone(), st.deal.avg_price, st.deal.total_qty, st.deal.side)
        };
        let price = self.round_price(tp_price(avg, self.cfg.tp_percent, side));
        let qty = self.round_qty(total);

        if !old_id.is_empty() {
            info!(order_id = %old_id, price, qty, avg, "repricing take-profit");
            let c = self.client.clone();
            let symbol = self.cfg.symbol.as_str();
            match self.retry.run(&self.shutdown, "cancel_order", || c.cancel_order(symbol, &old_id)).await {
                Ok(()) => metrics::ORDER_CANCELS.inc(),
                Err(e) if e.is_not_found() => debug!(order_id = %old_id, "old take-profit already gone"),
                Err(e) => return Err(e.into()),
            }
            {
                let mut st = self.state().await;
                if st.deal.tp_order_id == old_id {
                    st.deal.tp_order_id.clear();
                }
            }
            self.pause(CANCEL_SETTLE).await?;
        }
        self.submit_tp(price, qty).await
    }

    /// Place the reduce-only TP limit unless one is still resting.
    pub(crate) async fn place_tp(&self, price: f64, qty: f64) -> EngineResult<()> {
        let _tp = self.tp_lock.lock().await;
        self.submit_tp(price, qty).await
    }

    // caller holds tp_lock
    async fn submit_tp(&self, price: f64, qty: f64) -> EngineResult<()> {
        if qty < self.rules.min_qty || qty <= 0.0 {
            warn!(qty, min_qty = self.rules.min_qty, "take-profit skipped, qty below minimum");
            return Ok(());
        }
        self.wait_no_open_tp_orders().await?;

        let qty = self.resolve_tp_qty(qty).await?;
        if qty <= 0.0 {
            return Ok(());
        }
        let (deal_id, side) = {
            let st = self.state().await;
            if !st.deal.active {
                return Ok(());
            }
            (st.deal.deal_id.clone(), st.deal.side)
        };
        let link_id = self.next_tp_link(&deal_id);
        let mut order = self.limit_order(side.opposite(), OrderKind::TakeProfit, price, qty, link_id.clone());
        order.reduce_only = true;
        risk::check_min_notional(&order, price, &self.rules)?;

        {
            let mut st = self.state().await;
            st.deal.tp_link_id = link_id.clone();
            st.deal.planned_tp_price = price;
            st.deal.planned_tp_qty = qty;
        }
        info!(deal_id = %deal_id, link_id = %link_id, price, qty, "placing take-profit");
        let placed = self.place_order_idempotent(&order).await?;
        {
            let mut st = self.state().await;
            if st.deal.tp_link_id == link_id {
                st.deal.tp_order_id = placed.id.clone();
            }
        }
        info!(link_id = %link_id, order_id = %placed.id, "take-profit placed");
        self.confirm_tp_status(&link_id, &placed.id).await;
        Ok(())
    }

    async fn has_open_tp_orders(&self) -> EngineResult<Option<String>> {
        let deal_id = {
            let st = self.state().await;
            if !st.deal.active {
                return Ok(None);
            }
            st.deal.deal_id.clone()
        };
        let open = self.open_orders().await?;
        Ok(open
            .into_iter()
            .find(|o| linkid::is_tp(&o.link_id) && linkid::deal_id_of(&o.link_id) == Some(deal_id.as_str()))
            .map(|o| o.link_id))
    }

    async fn wait_no_open_tp_orders(&self) -> EngineResult<()> {
        let mut last_err = None;
        let mut still_open = String::new();
        for i in 0..OPEN_TP_CHECKS {
            match self.has_open_tp_orders().await {
                Ok(None) => return Ok(()),
                Ok(Some(link)) => {
                    last_err = None;
                    debug!(link_id = %link, attempt = i + 1, "take-profit still open");
                    still_open = link;
                }
                Err(e) => last_err = Some(e),
            }
            if i + 1 < OPEN_TP_CHECKS {
                self.pause(OPEN_TP_DELAY).await?;
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Err(EngineError::TakeProfitStillOpen(still_open)),
        }
    }

    /// Size the TP against the base balance so it never exceeds what settled.
    /// Long spot deals only; other cases pass the qty through.
    pub(crate) async fn resolve_tp_qty(&self, qty: f64) -> EngineResult<f64> {
        let base = &self.rules.base_coin;
        let (side, last_fill_at) = {
            let st = self.state().await;
            (st.deal.side, st.deal.last_fill_at)
        };
        if side != Side::Buy || base.is_empty() {
            return Ok(qty);
        }
        let qty = self.round_qty(qty);
        if qty <= 0.0 {
            return Ok(0.0);
        }
        let need = (qty - self.rules.lot_size / 2.0).max(0.0);

        if let Some(t) = last_fill_at {
            let since = t.elapsed();
            if since < FILL_SETTLE {
                self.pause(FILL_SETTLE - since).await?;
            }
        }

        let mut last = Balance::default();
        let mut last_err: Option<ExchangeError> = None;
        for i in 0..BALANCE_POLLS {
            match self.client.get_balances(std::slice::from_ref(base)).await {
                Ok(b) => {
                    last_err = None;
                    last = b.get(base).copied().unwrap_or_default();
                    if last.effective() >= need {
                        return Ok(qty);
                    }
                }
                Err(e) => last_err = Some(e),
            }
            if i + 1 < BALANCE_POLLS {
                debug!(need, balance = last.effective(), "waiting for base balance to settle");
                self.pause(BALANCE_POLL_DELAY).await?;
            }
        }
        if let Some(e) = last_err {
            return Err(e.into());
        }

        let balance = last.effective();
        // nothing settled counts as far short; the scheduler retries
        if balance <= 0.0 || balance / qty < BALANCE_RATIO_MIN {
            warn!(balance, qty, "base balance not settled for take-profit");
            return Err(EngineError::BalanceNotSettled { available: balance, target: qty });
        }
        let adjusted = self.round_qty(balance);
        if adjusted < self.rules.min_qty || adjusted <= 0.0 {
            warn!(balance, adjusted, min_qty = self.rules.min_qty, "take-profit skipped, balance below minimum");
            return Ok(0.0);
        }
        if adjusted < qty {
            info!(from = qty, to = adjusted, "take-profit downsized to available balance");
            let mut st = self.state().await;
            if adjusted < st.deal.total_qty && adjusted / qty >= BALANCE_RATIO_MIN {
                st.deal.total_qty = adjusted;
                Engine::publish_gauges(&st.deal);
            }
        }
        Ok(adjusted)
    }

    /// Diagnostic lookup right after placement.
    async fn confirm_tp_status(&self, link_id: &str, order_id: &str) {
        let matches = |o: &Order| (!order_id.is_empty() && o.id == order_id) || o.link_id == link_id;
        if let Ok(open) = self.open_orders().await {
            if let Some(o) = open.iter().find(|o| matches(o)) {
                info!(link_id, order_id = %o.id, leaves_qty = o.leaves_qty(), "take-profit resting");
                return;
            }
        }
        if let Ok(fills) = self.fills().await {
            let filled: f64 = fills.iter().filter(|f| f.link_id == link_id || (!order_id.is_empty() && f.order_id == order_id)).map(|f| f.qty).sum();
            if filled > 0.0 {
                info!(link_id, filled, "take-profit already filled");
                return;
            }
        }
        warn!(link_id, order_id, "take-profit not found after placement");
    }
}
