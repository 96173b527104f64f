// =============================================================================
// Candle Store - durable keyed table of closed OHLCV bars
// =============================================================================
//
// Append-only: the natural key (symbol, interval, open_time) is unique and a
// duplicate write is an idempotent no-op, never an error. This is what lets
// several instance threads persist the same bars concurrently.
//
// Calls are synchronous. They run on the dedicated thread of the calling
// instance, so a slow write only stalls that one instance.
// =============================================================================

pub mod memory;
pub mod sqlite;

use anyhow::Result;

use crate::market_data::Candle;

pub use memory::MemoryCandleStore;
pub use sqlite::SqliteCandleStore;

pub trait CandleStore: Send + Sync {
    /// Insert candles, silently skipping any whose key already exists.
    /// Returns the number of rows actually inserted.
    fn upsert_ignore_duplicates(&self, candles: &[Candle]) -> Result<usize>;

    /// All candles for `(symbol, interval)` with `start <= open_time <= end`
    /// (`end` unbounded when `None`), ordered by `open_time`.
    fn query_range(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: Option<i64>,
    ) -> Result<Vec<Candle>>;
}
