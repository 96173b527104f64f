// =============================================================================
// Candle Cache Reconciler
// =============================================================================
//
// Serves a [start, end] window of closed candles from the store, asking the
// provider only for what the store is missing:
//
//   store empty / interval has no fixed length  -> full fetch
//   start + end covered and dense               -> cache hit, no provider call
//   start covered and dense, end missing        -> tail fetch [last + bar, end]
//   anything else                               -> full fetch
//
// Provider failures degrade to whatever is cached; store failures are logged
// and the in-memory result is returned anyway.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::market_data::candle::clip_to_window;
use crate::market_data::{interval_duration_ms, merge_series, Candle};
use crate::provider::MarketDataProvider;
use crate::runtime_config::CacheSettings;
use crate::store::CandleStore;
use crate::types::now_ms;

/// How a fetch was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    CacheHit,
    TailFetch,
    FullFetch,
    /// The provider failed (or returned nothing) and cached data was served.
    StaleCache,
    /// The provider failed and nothing was cached.
    Unavailable,
}

impl std::fmt::Display for FetchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CacheHit => write!(f, "cache_hit"),
            Self::TailFetch => write!(f, "tail_fetch"),
            Self::FullFetch => write!(f, "full_fetch"),
            Self::StaleCache => write!(f, "stale_cache"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    /// Ordered by `open_time`, unique keys, clipped to the window.
    pub candles: Vec<Candle>,
    pub source: FetchSource,
}

impl FetchResult {
    /// No data for the window, whether because the provider failed or had
    /// nothing to give.
    pub fn data_unavailable(&self) -> bool {
        self.candles.is_empty()
    }
}

/// Coverage of a window by the cached series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Coverage {
    start_covered: bool,
    end_covered: bool,
    dense: bool,
}

pub struct CandleCache {
    store: Arc<dyn CandleStore>,
    provider: Arc<dyn MarketDataProvider>,
    settings: CacheSettings,
}

impl CandleCache {
    pub fn new(
        store: Arc<dyn CandleStore>,
        provider: Arc<dyn MarketDataProvider>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn CandleStore> {
        &self.store
    }

    /// Closed candles for `symbol`/`interval` with `start <= open_time <= end`
    /// (`end` = now when `None`).
    pub async fn fetch(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: Option<i64>,
    ) -> FetchResult {
        self.fetch_at(symbol, interval, start, end, now_ms()).await
    }

    /// [`fetch`](Self::fetch) with an explicit wall clock.
    pub async fn fetch_at(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: Option<i64>,
        now: i64,
    ) -> FetchResult {
        let cached = match self.store.query_range(symbol, interval, start, end) {
            Ok(candles) => candles,
            Err(e) => {
                warn!(symbol, interval, error = %e, "candle store query failed, treating cache as empty");
                Vec::new()
            }
        };

        let bar_ms = match interval_duration_ms(interval) {
            Some(ms) => ms,
            None => {
                debug!(symbol, interval, "interval has no fixed duration, full fetch");
                return self.full_fetch(symbol, interval, start, end, cached).await;
            }
        };
        if cached.is_empty() {
            return self.full_fetch(symbol, interval, start, end, cached).await;
        }

        let coverage = self.coverage(&cached, bar_ms, start, end, now);
        debug!(
            symbol,
            interval,
            cached = cached.len(),
            start_covered = coverage.start_covered,
            end_covered = coverage.end_covered,
            dense = coverage.dense,
            "cache coverage"
        );

        if coverage.start_covered && coverage.end_covered && coverage.dense {
            return FetchResult {
                candles: clip_to_window(cached, start, end),
                source: FetchSource::CacheHit,
            };
        }
        if coverage.start_covered && coverage.dense {
            return self.tail_fetch(symbol, interval, start, end, bar_ms, cached).await;
        }
        self.full_fetch(symbol, interval, start, end, cached).await
    }

    fn coverage(&self, cached: &[Candle], bar_ms: i64, start: i64, end: Option<i64>, now: i64) -> Coverage {
        let (first, last) = match (cached.first(), cached.last()) {
            (Some(f), Some(l)) => (f.open_time, l.open_time),
            _ => {
                return Coverage {
                    start_covered: false,
                    end_covered: false,
                    dense: false,
                }
            }
        };

        // First bar boundary at or after `start`.
        let aligned_start = start.div_euclid(bar_ms) * bar_ms
            + if start.rem_euclid(bar_ms) == 0 { 0 } else { bar_ms };
        // The bar open at `now` is still forming and can never be cached.
        let current_bar_open = now.div_euclid(bar_ms) * bar_ms;
        let effective_end = end.unwrap_or(now).min(current_bar_open);

        let cached_until = (last + bar_ms).min(effective_end);
        let expected = (cached_until - aligned_start) as f64 / bar_ms as f64;
        let dense = expected <= 0.0 || cached.len() as f64 >= self.settings.density_threshold * expected;

        Coverage {
            start_covered: first <= aligned_start,
            end_covered: last + bar_ms >= effective_end,
            dense,
        }
    }

    async fn tail_fetch(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: Option<i64>,
        bar_ms: i64,
        cached: Vec<Candle>,
    ) -> FetchResult {
        let tail_start = cached.last().map_or(start, |c| c.open_time + bar_ms);
        match self.provider.historical_candles(symbol, interval, tail_start, end).await {
            Ok(tail) => {
                info!(symbol, interval, tail_start, fetched = tail.len(), "tail fetch");
                self.persist(&tail);
                FetchResult {
                    candles: clip_to_window(merge_series(cached, tail), start, end),
                    source: FetchSource::TailFetch,
                }
            }
            Err(e) => {
                warn!(symbol, interval, error = %e, "tail fetch failed, serving cached data");
                FetchResult {
                    candles: clip_to_window(cached, start, end),
                    source: FetchSource::StaleCache,
                }
            }
        }
    }

    async fn full_fetch(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: Option<i64>,
        cached: Vec<Candle>,
    ) -> FetchResult {
        match self.provider.historical_candles(symbol, interval, start, end).await {
            Ok(fetched) if fetched.is_empty() && !cached.is_empty() => {
                warn!(symbol, interval, "provider returned no candles, serving cached data");
                FetchResult {
                    candles: clip_to_window(cached, start, end),
                    source: FetchSource::StaleCache,
                }
            }
            Ok(fetched) => {
                info!(symbol, interval, start, fetched = fetched.len(), "full fetch");
                self.persist(&fetched);
                FetchResult {
                    candles: clip_to_window(merge_series(cached, fetched), start, end),
                    source: FetchSource::FullFetch,
                }
            }
            Err(e) if !cached.is_empty() => {
                warn!(symbol, interval, error = %e, "full fetch failed, serving stale cache");
                FetchResult {
                    candles: clip_to_window(cached, start, end),
                    source: FetchSource::StaleCache,
                }
            }
            Err(e) => {
                warn!(symbol, interval, error = %e, "full fetch failed and nothing cached");
                FetchResult {
                    candles: Vec::new(),
                    source: FetchSource::Unavailable,
                }
            }
        }
    }

    fn persist(&self, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }
        match self.store.upsert_ignore_duplicates(candles) {
            Ok(inserted) => debug!(requested = candles.len(), inserted, "candles cached"),
            Err(e) => warn!(error = %e, count = candles.len(), "failed to persist candles"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle::test_candle;
    use crate::store::MemoryCandleStore;
    use crate::testing::{FailingStore, FakeProvider};

    const BAR: i64 = 60_000;
    const T0: i64 = 1_700_000_040_000 - (1_700_000_040_000 % BAR);

    fn series(from: i64, count: i64) -> Vec<Candle> {
        (0..count)
            .map(|i| test_candle(from + i * BAR, 100.0 + i as f64))
            .collect()
    }

    fn cache_with(store: Arc<dyn CandleStore>, provider: Arc<FakeProvider>) -> CandleCache {
        CandleCache::new(store, provider, CacheSettings::default())
    }

    #[tokio::test]
    async fn repeated_fetch_is_served_from_cache() {
        let provider = Arc::new(FakeProvider::with_history(series(T0, 500)));
        let cache = cache_with(Arc::new(MemoryCandleStore::new()), provider.clone());
        let end = Some(T0 + 99 * BAR);
        let now = T0 + 1_000 * BAR;

        let first = cache.fetch_at("BTCUSDT", "1m", T0, end, now).await;
        assert_eq!(first.source, FetchSource::FullFetch);
        assert_eq!(first.candles.len(), 100);
        assert_eq!(provider.history_calls().len(), 1);

        let second = cache.fetch_at("BTCUSDT", "1m", T0, end, now).await;
        let third = cache.fetch_at("BTCUSDT", "1m", T0, end, now).await;
        assert_eq!(second.source, FetchSource::CacheHit);
        assert_eq!(provider.history_calls().len(), 1);
        assert_eq!(
            serde_json::to_string(&first.candles).unwrap(),
            serde_json::to_string(&second.candles).unwrap()
        );
        assert_eq!(second, third);
    }

    #[tokio::test]
    async fn gap_fill_requests_only_the_missing_tail() {
        let t1 = T0 + 60 * BAR;
        let t2 = T0 + 90 * BAR;
        let store = Arc::new(MemoryCandleStore::new());
        store.upsert_ignore_duplicates(&series(T0, 60)).unwrap();

        let provider = Arc::new(FakeProvider::with_history(series(T0, 200)));
        let cache = cache_with(store.clone(), provider.clone());

        let result = cache.fetch_at("BTCUSDT", "1m", T0, Some(t2), t2 + 10 * BAR).await;
        assert_eq!(result.source, FetchSource::TailFetch);
        assert_eq!(
            provider.history_calls(),
            vec![("BTCUSDT".to_string(), "1m".to_string(), t1, Some(t2))]
        );

        // Gap-free, sorted, inclusive of both ends.
        assert_eq!(result.candles.len(), 91);
        assert_eq!(result.candles.first().unwrap().open_time, T0);
        assert_eq!(result.candles.last().unwrap().open_time, t2);
        assert!(result.candles.windows(2).all(|w| w[1].open_time - w[0].open_time == BAR));

        // The tail was persisted: a repeat is a cache hit.
        assert_eq!(store.len(), 91);
        let again = cache.fetch_at("BTCUSDT", "1m", T0, Some(t2), t2 + 10 * BAR).await;
        assert_eq!(again.source, FetchSource::CacheHit);
        assert_eq!(provider.history_calls().len(), 1);
    }

    #[tokio::test]
    async fn open_ended_window_tracks_the_last_closed_bar() {
        let now = T0 + 100 * BAR + 30_000;
        let store = Arc::new(MemoryCandleStore::new());
        // Cached up to and including the bar before the forming one.
        store.upsert_ignore_duplicates(&series(T0, 100)).unwrap();
        let provider = Arc::new(FakeProvider::with_history(series(T0, 100)));
        let cache = cache_with(store, provider.clone());

        let result = cache.fetch_at("BTCUSDT", "1m", T0, None, now).await;
        assert_eq!(result.source, FetchSource::CacheHit);
        assert!(provider.history_calls().is_empty());
    }

    #[tokio::test]
    async fn uncovered_start_triggers_full_fetch() {
        let store = Arc::new(MemoryCandleStore::new());
        store.upsert_ignore_duplicates(&series(T0 + 10 * BAR, 20)).unwrap();
        let provider = Arc::new(FakeProvider::with_history(series(T0, 30)));
        let cache = cache_with(store, provider.clone());

        let result = cache.fetch_at("BTCUSDT", "1m", T0, Some(T0 + 29 * BAR), T0 + 100 * BAR).await;
        assert_eq!(result.source, FetchSource::FullFetch);
        assert_eq!(result.candles.len(), 30);
        assert_eq!(provider.history_calls()[0].2, T0);
    }

    #[tokio::test]
    async fn sparse_cache_is_not_trusted() {
        let store = Arc::new(MemoryCandleStore::new());
        // Every other bar only: 50 % density.
        let sparse: Vec<Candle> = series(T0, 40).into_iter().step_by(2).collect();
        store.upsert_ignore_duplicates(&sparse).unwrap();
        let provider = Arc::new(FakeProvider::with_history(series(T0, 40)));
        let cache = cache_with(store, provider.clone());

        let result = cache.fetch_at("BTCUSDT", "1m", T0, Some(T0 + 39 * BAR), T0 + 100 * BAR).await;
        assert_eq!(result.source, FetchSource::FullFetch);
        assert_eq!(result.candles.len(), 40);
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_cached_data() {
        let store = Arc::new(MemoryCandleStore::new());
        store.upsert_ignore_duplicates(&series(T0, 10)).unwrap();
        let provider = Arc::new(FakeProvider::with_history(Vec::new()));
        provider.set_history_failure(true);
        let cache = cache_with(store, provider.clone());

        let result = cache.fetch_at("BTCUSDT", "1m", T0, Some(T0 + 19 * BAR), T0 + 100 * BAR).await;
        assert_eq!(result.source, FetchSource::StaleCache);
        assert_eq!(result.candles.len(), 10);
    }

    #[tokio::test]
    async fn provider_failure_without_cache_is_unavailable() {
        let provider = Arc::new(FakeProvider::with_history(Vec::new()));
        provider.set_history_failure(true);
        let cache = cache_with(Arc::new(MemoryCandleStore::new()), provider);

        let result = cache.fetch_at("BTCUSDT", "1m", T0, None, T0 + 100 * BAR).await;
        assert_eq!(result.source, FetchSource::Unavailable);
        assert!(result.data_unavailable());
    }

    #[tokio::test]
    async fn store_failure_still_returns_provider_data() {
        let provider = Arc::new(FakeProvider::with_history(series(T0, 10)));
        let cache = cache_with(Arc::new(FailingStore), provider);

        let result = cache.fetch_at("BTCUSDT", "1m", T0, Some(T0 + 9 * BAR), T0 + 100 * BAR).await;
        assert_eq!(result.source, FetchSource::FullFetch);
        assert_eq!(result.candles.len(), 10);
    }

    #[tokio::test]
    async fn calendar_interval_always_full_fetches() {
        let store = Arc::new(MemoryCandleStore::new());
        let monthly: Vec<Candle> = series(T0, 3)
            .into_iter()
            .map(|c| Candle {
                interval: "1M".into(),
                ..c
            })
            .collect();
        store.upsert_ignore_duplicates(&monthly).unwrap();
        let provider = Arc::new(FakeProvider::with_history(monthly));
        let cache = cache_with(store, provider.clone());

        cache.fetch_at("BTCUSDT", "1M", T0, None, T0 + 100 * BAR).await;
        cache.fetch_at("BTCUSDT", "1M", T0, None, T0 + 100 * BAR).await;
        assert_eq!(provider.history_calls().len(), 2);
    }
}
