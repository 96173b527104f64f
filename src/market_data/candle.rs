use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single closed OHLCV bar. Natural key is `(symbol, interval, open_time)`.
///
/// Candles are immutable once persisted: the cache only ever adds bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    /// Bar open time, UTC milliseconds.
    pub open_time: i64,
    /// Bar close time, UTC milliseconds (exchange convention: open + duration - 1).
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// Interval arithmetic
// ---------------------------------------------------------------------------

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Fixed bar duration for an exchange interval string (`"1m"`, `"15m"`,
/// `"4h"`, `"1d"`, `"1w"`, ...).
///
/// Returns `None` for calendar-based intervals such as `"1M"` (month), whose
/// bars have no fixed length.
pub fn interval_duration_ms(interval: &str) -> Option<i64> {
    let (unit_at, _) = interval.char_indices().last()?;
    let (digits, unit) = interval.split_at(unit_at);
    let count: i64 = digits.parse().ok()?;
    if count <= 0 {
        return None;
    }
    let unit_ms = match unit {
        "m" => MINUTE_MS,
        "h" => HOUR_MS,
        "d" => DAY_MS,
        "w" => 7 * DAY_MS,
        _ => return None,
    };
    Some(count * unit_ms)
}

/// Whether `interval` is one the pipeline can run on: any fixed-length
/// interval, or the calendar month.
pub fn is_supported_interval(interval: &str) -> bool {
    interval == CALENDAR_MONTH || interval_duration_ms(interval).is_some()
}

pub const CALENDAR_MONTH: &str = "1M";

/// UTC day index of a millisecond timestamp (days since the epoch).
pub fn day_index(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(DAY_MS)
}

// ---------------------------------------------------------------------------
// Series helpers
// ---------------------------------------------------------------------------

/// Merge two batches into one series ordered by `open_time` with unique keys.
///
/// On a key collision the record from `primary` wins; a record from
/// `secondary` with an already-seen `open_time` is discarded.
pub fn merge_series(primary: Vec<Candle>, secondary: Vec<Candle>) -> Vec<Candle> {
    let mut by_time: BTreeMap<i64, Candle> = BTreeMap::new();
    for candle in primary.into_iter().chain(secondary) {
        by_time.entry(candle.open_time).or_insert(candle);
    }
    by_time.into_values().collect()
}

/// Keep only candles whose `open_time` lies inside `[start, end]`
/// (`end` unbounded when `None`).
pub fn clip_to_window(series: Vec<Candle>, start: i64, end: Option<i64>) -> Vec<Candle> {
    series
        .into_iter()
        .filter(|c| c.open_time >= start && end.map_or(true, |e| c.open_time <= e))
        .collect()
}

#[cfg(test)]
pub(crate) fn test_candle(open_time: i64, close: f64) -> Candle {
    Candle {
        symbol: "BTCUSDT".into(),
        interval: "1m".into(),
        open_time,
        close_time: open_time + MINUTE_MS - 1,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 100.0,
    }
}
