//! Market-data collection engine for Binance USDT-margined perpetual futures:
//! a rate-limited REST/WS client, a pooled SQLite time-series store, and the
//! collectors and backfiller that keep it filled.

pub mod backfill;
pub mod config;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod metrics_collector;
pub mod model;
pub mod rate_limiter;
pub mod store;
pub mod symbols;
pub mod ws_collector;
