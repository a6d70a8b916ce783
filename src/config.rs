// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : dca_bot — async spot DCA trading engine in Rust
Module  : config.rs
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
use std::env;
use std::str::FromStr;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;

use crate::domain::{QtyUnit, Side};
use crate::gateway_bybit::BybitConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid SIDE {0:?} (expected buy or sell)")]
    InvalidSide(String),
    #[error("invalid number for {key}: {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} is required for live trading")]
    MissingCredentials(&'static str),
}

/// Venue yang dipakai untuk order & stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Paper,
    BybitTestnet,
    BybitMainnet,
}

impl VenueMode {
    pub fn parse(s: &str) -> Option<VenueMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "mock" => Some(VenueMode::Paper),
            "bybit_testnet" | "testnet" => Some(VenueMode::BybitTestnet),
            "bybit_mainnet" | "mainnet" => Some(VenueMode::BybitMainnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Paper => "paper",
            VenueMode::BybitTestnet => "bybit_testnet",
            VenueMode::BybitMainnet => "bybit_mainnet",
        }
    }

    // Endpoint default per mode (paper never dials out)
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            VenueMode::BybitMainnet => "https://api.bybit.com",
            _ => "https://api-testnet.bybit.com",
        }
    }

    pub fn default_ws_public_url(&self) -> &'static str {
        match self {
            VenueMode::BybitMainnet => "wss://stream.bybit.com/v5/public/spot",
            _ => "wss://stream-testnet.bybit.com/v5/public/spot",
        }
    }

    pub fn default_ws_private_url(&self) -> &'static str {
        match self {
            VenueMode::BybitMainnet => "wss://stream.bybit.com/v5/private",
            _ => "wss://stream-testnet.bybit.com/v5/private",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<String>,
    pub rotation: LogRotation,
}

/// Strategy parameters of one deal cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct BotConfig {
    pub symbol: String,
    pub side: Side,
    pub base_order_qty: f64,
    pub qty_unit: QtyUnit,
    pub tp_percent: f64,
    pub so_count: usize,
    pub so_step_percent: f64,
    pub so_step_multiplier: f64,
    pub so_base_qty: f64,
    pub so_qty_multiplier: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            base_order_qty: 0.001,
            qty_unit: QtyUnit::BaseCoin,
            tp_percent: 1.0,
            so_count: 5,
            so_step_percent: 1.0,
            so_step_multiplier: 1.0,
            so_base_qty: 0.001,
            so_qty_multiplier: 1.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub bot: BotConfig,
    pub venue: VenueMode,
    pub bybit: BybitConfig,
    pub restore_on_start: bool,
    pub log: LogConfig,
    pub metrics_port: u16,
    pub paper_start_price: f64,
    pub paper_quote_balance: f64,
}

/// CLI overrides on top of the environment.
#[derive(Debug, Parser)]
#[command(name = "dca_bot", version, about = "Spot DCA trading bot")]
pub struct Cli {
    /// Trade against the in-memory paper venue
    #[arg(long)]
    pub dry_run: bool,
    /// Skip reconstructing a deal from exchange state at startup
    #[arg(long)]
    pub no_restore: bool,
    #[arg(long)]
    pub symbol: Option<String>,
    /// 0 disables the endpoint
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

fn num<T: FromStr>(get: &dyn Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidNumber { key, value: v }),
    }
}

fn flag(get: &dyn Fn(&str) -> Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match get(key).map(|s| s.trim().to_ascii_lowercase()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value: v }),
        },
    }
}

fn text(get: &dyn Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).unwrap_or_else(|| default.to_string())
}

/// Build settings from any key lookup (process env in `load`, maps in tests).
pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Settings, ConfigError> {
    let d = BotConfig::default();

    let side_raw = text(get, "SIDE", "buy");
    let side = Side::parse(&side_raw).ok_or(ConfigError::InvalidSide(side_raw))?;
    let unit_raw = text(get, "QTY_UNIT", "baseCoin");
    let qty_unit = match unit_raw.to_ascii_lowercase().as_str() {
        "basecoin" | "base" => QtyUnit::BaseCoin,
        "quotecoin" | "quote" => QtyUnit::QuoteCoin,
        _ => return Err(ConfigError::InvalidValue { key: "QTY_UNIT", value: unit_raw }),
    };

    let bot = BotConfig {
        symbol: text(get, "SYMBOL", &d.symbol).to_ascii_uppercase(),
        side,
        base_order_qty: num(get, "BASE_ORDER_QTY", d.base_order_qty)?,
        qty_unit,
        tp_percent: num(get, "TP_PERCENT", d.tp_percent)?,
        so_count: num(get, "SO_COUNT", d.so_count)?,
        so_step_percent: num(get, "SO_STEP_PERCENT", d.so_step_percent)?,
        so_step_multiplier: num(get, "SO_STEP_MULTIPLIER", d.so_step_multiplier)?,
        so_base_qty: num(get, "SO_BASE_QTY", d.so_base_qty)?,
        so_qty_multiplier: num(get, "SO_QTY_MULTIPLIER", d.so_qty_multiplier)?,
    };

    let venue_raw = text(get, "VENUE_MODE", "bybit_testnet");
    let mut venue = VenueMode::parse(&venue_raw).ok_or(ConfigError::InvalidValue { key: "VENUE_MODE", value: venue_raw })?;
    if flag(get, "DRY_RUN", false)? {
        venue = VenueMode::Paper;
    }

    let bybit = BybitConfig {
        rest_url: text(get, "BYBIT_REST_URL", venue.default_rest_url()),
        ws_public_url: text(get, "BYBIT_WS_PUBLIC_URL", venue.default_ws_public_url()),
        ws_private_url: text(get, "BYBIT_WS_PRIVATE_URL", venue.default_ws_private_url()),
        api_key: text(get, "BYBIT_API_KEY", ""),
        api_secret: text(get, "BYBIT_API_SECRET", ""),
        account_type: text(get, "BYBIT_ACCOUNT_TYPE", "UNIFIED"),
        recv_window: num(get, "BYBIT_RECV_WINDOW", 5000u64)?,
    };

    let format = match text(get, "LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
        "json" => LogFormat::Json,
        "text" | "pretty" => LogFormat::Text,
        other => return Err(ConfigError::InvalidValue { key: "LOG_FORMAT", value: other.to_string() }),
    };
    let rotation = match text(get, "LOG_ROTATION", "daily").to_ascii_lowercase().as_str() {
        "daily" => LogRotation::Daily,
        "hourly" => LogRotation::Hourly,
        "never" => LogRotation::Never,
        other => return Err(ConfigError::InvalidValue { key: "LOG_ROTATION", value: other.to_string() }),
    };
    let log = LogConfig {
        level: text(get, "LOG_LEVEL", "info").to_ascii_lowercase(),
        format,
        file: get("LOG_FILE").map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        rotation,
    };

    Ok(Settings {
        bot,
        venue,
        bybit,
        restore_on_start: flag(get, "RESTORE_ON_START", true)?,
        log,
        metrics_port: num(get, "METRICS_PORT", 9898u16)?,
        paper_start_price: num(get, "PAPER_START_PRICE", 100.0)?,
        paper_quote_balance: num(get, "PAPER_QUOTE_BALANCE", 10_000.0)?,
    })
}

impl Settings {
    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.dry_run {
            self.venue = VenueMode::Paper;
        }
        if cli.no_restore {
            self.restore_on_start = false;
        }
        if let Some(s) = &cli.symbol {
            self.bot.symbol = s.trim().to_ascii_uppercase();
        }
        if let Some(p) = cli.metrics_port {
            self.metrics_port = p;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.venue == VenueMode::Paper {
            return Ok(());
        }
        if self.bybit.api_key.is_empty() {
            return Err(ConfigError::MissingCredentials("BYBIT_API_KEY"));
        }
        if self.bybit.api_secret.is_empty() {
            return Err(ConfigError::MissingCredentials("BYBIT_API_SECRET"));
        }
        Ok(())
    }
}

/// `.env` → process env → CLI flags.
pub fn load() -> Result<Settings, ConfigError> {
    // Pastikan .env dibaca sebelum env diproses
    let _ = dotenv();
    let cli = Cli::parse();
    let mut settings = from_lookup(&|k| env::var(k).ok())?;
    settings.apply_cli(&cli);
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_apply() {
        let s = from_lookup(&lookup(&[])).unwrap();
        assert_eq!(s.bot, BotConfig::default());
        assert_eq!(s.venue, VenueMode::BybitTestnet);
        assert_eq!(s.bybit.rest_url, "https://api-testnet.bybit.com");
        assert_eq!(s.bybit.recv_window, 5000);
        assert!(s.restore_on_start);
        assert_eq!(s.metrics_port, 9898);
        assert_eq!(s.log.format, LogFormat::Text);
        assert_eq!(s.log.rotation, LogRotation::Daily);
        assert!(s.log.file.is_none());
    }

    #[test]
    fn parses_overrides() {
        let s = from_lookup(&lookup(&[
            ("SIDE", "Sell"),
            ("QTY_UNIT", "quoteCoin"),
            ("SO_COUNT", "3"),
            ("VENUE_MODE", "bybit_mainnet"),
            ("LOG_FORMAT", "json"),
            ("symbol", "ignored"),
            ("SYMBOL", "ethusdt"),
        ]))
        .unwrap();
        assert_eq!(s.bot.side, Side::Sell);
        assert_eq!(s.bot.qty_unit, QtyUnit::QuoteCoin);
        assert_eq!(s.bot.so_count, 3);
        assert_eq!(s.bot.symbol, "ETHUSDT");
        assert_eq!(s.bybit.ws_private_url, "wss://stream.bybit.com/v5/private");
        assert_eq!(s.log.format, LogFormat::Json);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(from_lookup(&lookup(&[("SIDE", "long")])).unwrap_err(), ConfigError::InvalidSide("long".into()));
        assert!(matches!(
            from_lookup(&lookup(&[("TP_PERCENT", "abc")])).unwrap_err(),
            ConfigError::InvalidNumber { key: "TP_PERCENT", .. }
        ));
        assert!(matches!(from_lookup(&lookup(&[("DRY_RUN", "maybe")])).unwrap_err(), ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn live_venue_needs_credentials() {
        let s = from_lookup(&lookup(&[])).unwrap();
        assert_eq!(s.validate(), Err(ConfigError::MissingCredentials("BYBIT_API_KEY")));

        let paper = from_lookup(&lookup(&[("DRY_RUN", "true")])).unwrap();
        assert_eq!(paper.venue, VenueMode::Paper);
        assert!(paper.validate().is_ok());
    }

    #[test]
    fn cli_overrides_env() {
        let mut s = from_lookup(&lookup(&[])).unwrap();
        let cli = Cli::parse_from(["dca_bot", "--dry-run", "--no-restore", "--symbol", "solusdt", "--metrics-port", "0"]);
        s.apply_cli(&cli);
        assert_eq!(s.venue, VenueMode::Paper);
        assert!(!s.restore_on_start);
        assert_eq!(s.bot.symbol, "SOLUSDT");
        assert_eq!(s.metrics_port, 0);
    }
}
