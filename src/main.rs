// ===============================
// src/main.rs
// ===============================
/*
 # paper run, no exchange keys needed
 DRY_RUN=true RUST_LOG=dca_bot=debug cargo run

 # status deal & order flow
curl -s localhost:9898/metrics | egrep '^(deal_active|position_qty|position_avg_price|last_price)'
curl -s localhost:9898/metrics | grep '^orders_placed_total'

*/
/*
=============================================================================
Project : dca_bot — async spot DCA trading engine in Rust
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Runs one DCA cycle at a time on a spot venue (Bybit v5 or an
          in-memory paper venue): market entry, a geometric safety-order
          grid, one take-profit tracking the average cost, crash restore
          from exchange state, Prometheus metrics.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dca_bot::config::{self, VenueMode};
use dca_bot::exchange::ExchangeClient;
use dca_bot::gateway::{PaperConfig, PaperExchange};
use dca_bot::gateway_bybit::BybitClient;
use dca_bot::{feed, logging, metrics, Engine};

const MOCK_TICK_EVERY: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Load config ----
    let settings = match config::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(2);
        }
    };

    // ---- Logging ---- (guard must outlive the run)
    let _log_guard = logging::init(&settings.log);

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(settings.metrics_port);
    metrics::CONFIG_VENUE_MODE.with_label_values(&[settings.venue.as_str()]).set(1);
    metrics::CONFIG_SYMBOL.with_label_values(&[&settings.bot.symbol]).set(1);

    let bot = &settings.bot;
    info!(
        venue_mode = settings.venue.as_str(),
        symbol = %bot.symbol,
        side = bot.side.as_str(),
        base_qty = bot.base_order_qty,
        qty_unit = bot.qty_unit.as_str(),
        tp_percent = bot.tp_percent,
        so_count = bot.so_count,
        so_step_percent = bot.so_step_percent,
        restore = settings.restore_on_start,
        rest = %settings.bybit.rest_url,
        "startup config"
    );

    // ---- Shutdown ----
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let token = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("ctrl-c received, shutting down");
            }
            token.cancel();
        }
    });

    // ---- Venue ----
    let client: Arc<dyn ExchangeClient> = match settings.venue {
        VenueMode::Paper => {
            let paper = Arc::new(PaperExchange::new(PaperConfig::new(
                &bot.symbol,
                settings.paper_start_price,
                settings.paper_quote_balance,
            )));
            tokio::spawn(feed::run_mock(paper.clone(), shutdown.clone(), MOCK_TICK_EVERY));
            paper as Arc<dyn ExchangeClient>
        }
        VenueMode::BybitTestnet | VenueMode::BybitMainnet => match BybitClient::new(settings.bybit.clone(), shutdown.clone()) {
            Ok(c) => Arc::new(c) as Arc<dyn ExchangeClient>,
            Err(e) => {
                error!(error = %e, "bybit client init failed");
                return ExitCode::FAILURE;
            }
        },
    };

    // ---- Engine ----
    let engine = match Engine::new(settings.bot.clone(), client, shutdown.clone()).await {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "engine bootstrap failed");
            return ExitCode::FAILURE;
        }
    };

    match engine.run(settings.restore_on_start).await {
        Ok(()) => {
            info!("stopped");
            ExitCode::SUCCESS
        }
        Err(e) if shutdown.is_cancelled() => {
            info!(error = %e, "stopped during shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "engine stopped with error");
            shutdown.cancel();
            ExitCode::FAILURE
        }
    }
}
