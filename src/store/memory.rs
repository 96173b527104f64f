use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use parking_lot::RwLock;

use super::CandleStore;
use crate::market_data::{Candle, CandleKey};

/// Process-local candle store. Same semantics as the SQLite store, nothing
/// survives a restart.
#[derive(Default)]
pub struct MemoryCandleStore {
    series: RwLock<HashMap<CandleKey, BTreeMap<i64, Candle>>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of candles held across all series.
    pub fn len(&self) -> usize {
        self.series.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CandleStore for MemoryCandleStore {
    fn upsert_ignore_duplicates(&self, candles: &[Candle]) -> Result<usize> {
        let mut map = self.series.write();
        let mut inserted = 0;
        for c in candles {
            let series = map
                .entry(CandleKey::new(c.symbol.clone(), c.interval.clone()))
                .or_default();
            if !series.contains_key(&c.open_time) {
                series.insert(c.open_time, c.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn query_range(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let map = self.series.read();
        let key = CandleKey::new(symbol, interval);
        let end = end.unwrap_or(i64::MAX);
        if start > end {
            return Ok(Vec::new());
        }
        Ok(map
            .get(&key)
            .map(|series| series.range(start..=end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle::test_candle;

    #[test]
    fn memory_store_dedups_and_ranges() {
        let store = MemoryCandleStore::new();
        let batch: Vec<Candle> = (0..5).map(|i| test_candle(i * 60_000, i as f64)).collect();
        assert_eq!(store.upsert_ignore_duplicates(&batch).unwrap(), 5);
        assert_eq!(store.upsert_ignore_duplicates(&batch[..2]).unwrap(), 0);
        assert_eq!(store.len(), 5);

        let slice = store.query_range("BTCUSDT", "1m", 60_000, Some(180_000)).unwrap();
        assert_eq!(slice.len(), 3);
        assert!(store.query_range("BTCUSDT", "1m", 10, Some(5)).unwrap().is_empty());
    }
}
