// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::risk::RiskError;

/// Failure of an exchange call, classified so callers can decide
/// between retrying, resolving by look-up, or giving up.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("duplicate order link id: {0}")]
    DuplicateLinkId(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("rejected by exchange (code {code}): {msg}")]
    Rejected { code: i64, msg: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
}

impl ExchangeError {
    pub fn is_rate_limit(&self) -> bool { matches!(self, ExchangeError::RateLimited(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, ExchangeError::OrderNotFound(_)) }
    pub fn is_duplicate(&self) -> bool { matches!(self, ExchangeError::DuplicateLinkId(_)) }

    /// Only rate-limit and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::RateLimited(_) | ExchangeError::Transport(_))
    }

    /// Label for `exchange_retries_total{class}`.
    pub fn class(&self) -> &'static str {
        match self {
            ExchangeError::RateLimited(_) => "rate_limit",
            ExchangeError::Transport(_) => "transport",
            ExchangeError::DuplicateLinkId(_) => "duplicate",
            ExchangeError::OrderNotFound(_) => "not_found",
            _ => "other",
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            ExchangeError::RateLimited(e.to_string())
        } else {
            ExchangeError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self { ExchangeError::Decode(e.to_string()) }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error("order link id is required")]
    MissingLinkId,
    #[error("entry order {0} not filled in time")]
    EntryFillTimeout(String),
    #[error("no ticker price received in time")]
    NoTickerPrice,
    #[error("take-profit order still open: {0}")]
    TakeProfitStillOpen(String),
    #[error("balance not settled: available {available} of {target}")]
    BalanceNotSettled { available: f64, target: f64 },
    #[error("event stream closed")]
    StreamClosed,
    #[error("cancelled")]
    Cancelled,
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
pub type EngineResult<T> = Result<T, EngineError>;
