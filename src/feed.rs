// ===============================
// src/feed.rs
// ===============================
//
// Stream adapters feeding the merged event channel:
// - run_mock        : random-walk price driver for the paper venue
// - run_bybit_stream: one Bybit v5 WebSocket (public tickers or private
//                     order/execution), with auth, ping, resubscribe and
//                     reconnect backoff
//

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bybit::{self, WsMessage, WsOp};
use crate::domain::Event;
use crate::gateway::PaperExchange;
use crate::metrics::{TICKS, WS_CONNECTED, WS_RECONNECTS};

const PING_EVERY: Duration = Duration::from_secs(20);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 30_000;

/// Random walk on the paper venue's price (~4 ticks/s).
pub async fn run_mock(paper: Arc<PaperExchange>, token: CancellationToken, every: Duration) {
    let mut price = paper.price().await.max(1.0);
    loop {
        // jangan simpan ThreadRng melewati .await
        let step_bp = rand::thread_rng().gen_range(-15..=15) as f64;
        price = (price * (1.0 + step_bp / 10_000.0)).max(price * 0.5).max(0.01);
        paper.set_price((price * 100.0).round() / 100.0).await;
        TICKS.inc();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(every) => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// Label for logs and metrics: `public` / `private`.
    pub name: &'static str,
    pub url: String,
    /// Private streams authenticate with (api_key, api_secret).
    pub auth: Option<(String, String)>,
    pub topics: Vec<String>,
    /// Drop order/execution events for other instruments.
    pub symbol: String,
}

fn backoff_ms(attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(5);
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << shift).min(BACKOFF_MAX_MS);
    let jitter = rand::thread_rng().gen_range(0..=250);
    base + jitter
}

/// Runs until the token is cancelled or the receiver goes away.
pub async fn run_bybit_stream(spec: StreamSpec, tx: mpsc::Sender<Event>, token: CancellationToken) {
    let url = match Url::parse(&spec.url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, url = %spec.url, stream = spec.name, "bad ws url");
            return;
        }
    };

    let mut attempt: u32 = 0;
    let mut connected_before = false;
    loop {
        if token.is_cancelled() || tx.is_closed() {
            return;
        }
        info!(url = %url, stream = spec.name, "connecting bybit stream");
        match session(&spec, url.as_str(), &tx, &token, connected_before).await {
            Ok(()) => return,
            Err(SessionEnd::Established(reason)) => {
                connected_before = true;
                attempt = 1;
                warn!(stream = spec.name, %reason, "bybit stream disconnected, will reconnect");
            }
            Err(SessionEnd::Failed(reason)) => {
                attempt = attempt.saturating_add(1);
                error!(stream = spec.name, %reason, attempt, "bybit stream connect failed");
            }
        }
        WS_CONNECTED.with_label_values(&[spec.name]).set(0);
        WS_RECONNECTS.with_label_values(&[spec.name]).inc();

        let wait = Duration::from_millis(backoff_ms(attempt.max(1)));
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(wait) => {}
        }
    }
}

enum SessionEnd {
    /// Was live (subscribed) before dropping.
    Established(String),
    Failed(String),
}

async fn session(
    spec: &StreamSpec,
    url: &str,
    tx: &mpsc::Sender<Event>,
    token: &CancellationToken,
    reconnecting: bool,
) -> Result<(), SessionEnd> {
    let (ws, _resp) = connect_async(url).await.map_err(|e| SessionEnd::Failed(e.to_string()))?;
    let (mut write, mut read) = ws.split();

    if let Some((key, secret)) = &spec.auth {
        let expires = bybit::timestamp_ms() + 10_000;
        let args = bybit::ws_auth_args(key, secret, expires);
        let frame = json!({ "op": "auth", "args": [args[0], expires, args[2]] });
        write.send(Message::Text(frame.to_string())).await.map_err(|e| SessionEnd::Failed(e.to_string()))?;

        let ack = timeout(AUTH_TIMEOUT, async {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(t)) => t,
                    Ok(_) => continue,
                    Err(e) => return Err(e.to_string()),
                };
                if let Ok(msg) = serde_json::from_str::<WsMessage>(&text) {
                    if msg.op == "auth" {
                        return if msg.success == Some(true) { Ok(()) } else { Err(format!("auth rejected: {}", msg.ret_msg)) };
                    }
                }
            }
            Err("closed during auth".to_string())
        })
        .await;
        match ack {
            Ok(Ok(())) => debug!(stream = spec.name, "bybit stream authenticated"),
            Ok(Err(e)) => return Err(SessionEnd::Failed(e)),
            Err(_) => return Err(SessionEnd::Failed("auth timed out".into())),
        }
    }

    let sub = WsOp { op: "subscribe", args: spec.topics.clone() };
    let sub = serde_json::to_string(&sub).map_err(|e| SessionEnd::Failed(e.to_string()))?;
    write.send(Message::Text(sub)).await.map_err(|e| SessionEnd::Failed(e.to_string()))?;
    info!(stream = spec.name, topics = ?spec.topics, "bybit stream subscribed");
    WS_CONNECTED.with_label_values(&[spec.name]).set(1);

    if reconnecting && tx.send(Event::Reconnect).await.is_err() {
        return Ok(());
    }

    let mut ping = interval(PING_EVERY);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = ping.tick() => {
                let frame = json!({ "op": "ping" }).to_string();
                if let Err(e) = write.send(Message::Text(frame)).await {
                    return Err(SessionEnd::Established(e.to_string()));
                }
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(SessionEnd::Established("closed by peer".into())),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(SessionEnd::Established(e.to_string())),
                };
                for ev in decode(&text, &spec.symbol) {
                    if tx.send(ev).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Map one text frame to engine events. Acks, pongs and unknown topics yield nothing.
pub fn decode(text: &str, symbol: &str) -> Vec<Event> {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(?e, "undecodable ws frame");
            return Vec::new();
        }
    };
    if msg.topic.is_empty() {
        if msg.success == Some(false) {
            warn!(op = %msg.op, ret_msg = %msg.ret_msg, "bybit op rejected");
        }
        return Vec::new();
    }
    let wanted = |s: &str| symbol.is_empty() || s.is_empty() || s == symbol;
    let out: Result<Vec<Event>, serde_json::Error> = if msg.topic.starts_with("tickers.") {
        bybit::parse_tickers(&msg).map(|v| {
            TICKS.inc_by(v.len() as u64);
            v.into_iter().map(Event::Ticker).collect()
        })
    } else if msg.topic == "order" || msg.topic.starts_with("order.") {
        bybit::parse_orders(&msg).map(|v| v.into_iter().filter(|o| wanted(&o.symbol)).map(Event::Order).collect())
    } else if msg.topic == "execution" || msg.topic.starts_with("execution.") {
        bybit::parse_executions(&msg).map(|v| v.into_iter().filter(|f| wanted(&f.symbol)).map(Event::Fill).collect())
    } else {
        Ok(Vec::new())
    };
    out.unwrap_or_else(|e| {
        warn!(?e, topic = %msg.topic, "ws payload decode failed");
        Vec::new()
    })
}
