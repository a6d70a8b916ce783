// ===============================
// src/lib.rs
// ===============================
pub mod domain;
pub mod error;
pub mod exchange;
pub mod calc;
pub mod retry;
pub mod risk;
pub mod linkid;
pub mod deal;
pub mod engine;
pub mod orders;
pub mod lifecycle;
pub mod events;
pub mod tp;
pub mod restore;
pub mod bybit;
pub mod gateway_bybit;
pub mod feed;
pub mod gateway;        // paper venue (dry-run + test double)
pub mod config;
pub mod logging;
pub mod metrics;

pub use engine::Engine;
pub use exchange::ExchangeClient;
