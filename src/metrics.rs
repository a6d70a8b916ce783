// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Event stream --------
pub static EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("events_total", "stream events dispatched"), &["kind"]).unwrap()
});

pub static STALE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stale_events_total", "events dropped by the sequence watermark"),
        &["stream"],
    )
    .unwrap()
});

pub static DUPLICATE_FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("duplicate_fills_total", "fills dropped by exec id").unwrap());

pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks").unwrap());

// -------- Orders / exchange --------
pub static ORDERS_PLACED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_placed_total", "orders accepted by the venue"), &["kind"]).unwrap()
});

pub static ORDER_CANCELS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("order_cancels_total", "successful cancels").unwrap());

pub static EXCHANGE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exchange_retries_total", "retried exchange calls"), &["class"]).unwrap()
});

// -------- Deal lifecycle --------
pub static DEALS_OPENED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("deals_opened_total", "deals opened").unwrap());

pub static DEALS_CLOSED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("deals_closed_total", "deals finalized").unwrap());

pub static CLOSE_ABORTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("close_aborts_total", "closes aborted back to active").unwrap());

pub static TP_REBUILDS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("tp_rebuilds_total", "take-profit rebuilds completed").unwrap());

pub static DEAL_ACTIVE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("deal_active", "1 while a deal is active").unwrap());

pub static POSITION_QTY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("position_qty", "position size of the current deal").unwrap());

pub static POSITION_AVG_PRICE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("position_avg_price", "average entry of the current deal").unwrap());

pub static LAST_PRICE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("last_price", "last ticker price").unwrap());

// -------- WebSocket health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("ws_connected", "1 while the stream is subscribed"), &["stream"]).unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ws_reconnects_total", "stream reconnect attempts"), &["stream"]).unwrap()
});

// -------- Config visibility --------
pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_venue_mode", "active venue mode"), &["mode"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "configured symbol"), &["symbol"]).unwrap()
});

/// Register all metrics to the custom REGISTRY
pub fn init() {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(EVENTS.clone()),
        Box::new(STALE_EVENTS.clone()),
        Box::new(DUPLICATE_FILLS.clone()),
        Box::new(TICKS.clone()),
        Box::new(ORDERS_PLACED.clone()),
        Box::new(ORDER_CANCELS.clone()),
        Box::new(EXCHANGE_RETRIES.clone()),
        Box::new(DEALS_OPENED.clone()),
        Box::new(DEALS_CLOSED.clone()),
        Box::new(CLOSE_ABORTS.clone()),
        Box::new(TP_REBUILDS.clone()),
        Box::new(DEAL_ACTIVE.clone()),
        Box::new(POSITION_QTY.clone()),
        Box::new(POSITION_AVG_PRICE.clone()),
        Box::new(LAST_PRICE.clone()),
        Box::new(WS_CONNECTED.clone()),
        Box::new(WS_RECONNECTS.clone()),
        Box::new(CONFIG_VENUE_MODE.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
    ];
    for c in collectors {
        match REGISTRY.register(c) {
            // init twice (tests) is fine
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => warn!(error = %e, "metric registration failed"),
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Tiny HTTP 1.1 responder: GET /metrics (and /) get the text format, anything else 404
fn handle_client(mut stream: TcpStream) {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req).unwrap_or(0);
    let line = String::from_utf8_lossy(&req[..n]);
    let path = line.split_whitespace().nth(1).unwrap_or("/");

    let (status, body) = match path {
        "/" | "/metrics" => ("200 OK", encode_metrics()),
        _ => ("404 Not Found", b"not found\n".to_vec()),
    };
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean).
/// Port 0 disables it; a bind failure is logged, not fatal.
pub fn serve_metrics(port: u16) {
    if port == 0 {
        info!("metrics endpoint disabled");
        return;
    }
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, error = %e, "metrics bind failed");
                return;
            }
        };
        info!("metrics listening on http://{addr}/metrics");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(error = %e, "metrics accept error"),
            }
        }
    });
}
