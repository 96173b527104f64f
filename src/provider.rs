//! Market data provider abstraction.
//!
//! A provider supplies closed historical bars for a time range and a live
//! kline stream for one (symbol, interval). The Binance client implements it
//! for production; tests use in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;

use crate::market_data::{Candle, LiveCandleStream};

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Closed candles with `start_ms <= open_time <= end_ms` (`end_ms`
    /// defaults to now), oldest first. May be rate-limited or fail.
    async fn historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>>;

    /// Subscribe to live kline updates. Dropping the stream ends the
    /// subscription.
    async fn subscribe_live(&self, symbol: &str, interval: &str) -> Result<LiveCandleStream>;
}
