// =============================================================================
// Strategy Runner
// =============================================================================
//
// Cached market data, a deterministic signal pipeline, a backtest engine and
// a live orchestrator that runs one isolated instance per
// (symbol, strategy, timeframe).
// =============================================================================

pub mod api;
pub mod backtest;
pub mod binance;
pub mod broadcast;
pub mod candle_cache;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod market_data;
pub mod orchestrator;
pub mod provider;
pub mod runtime_config;
pub mod signals;
pub mod store;
pub mod strategy;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use candle_cache::{CandleCache, FetchResult, FetchSource};
pub use error::ControlError;
pub use orchestrator::Orchestrator;
