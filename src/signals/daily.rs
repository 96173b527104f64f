// =============================================================================
// Daily EMA projected onto an intraday series
// =============================================================================
//
// Closes are resampled to one per UTC day (the last close of the day) and an
// EMA is run over those daily closes. Each bar then carries the daily EMA as
// it stands at that bar: the completed-day EMA advanced by one step with the
// bar's own close as the provisional close of the current day.
//
// The last bar of a day therefore carries exactly that day's EMA, and no bar
// sees a close from later in its own day.
//
// The trend reference is counted in days, not bars: a bar on day d is
// compared with the completed EMA of day d - lookback.
// =============================================================================

use crate::indicators::ema_multiplier;
use crate::market_data::{day_index, Candle};

/// Per-bar daily EMA and the completed-day EMA `lookback_days` back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyEmaColumns {
    pub ema: Vec<Option<f64>>,
    pub reference: Vec<Option<f64>>,
}

/// Daily EMA of `period` days, one value per input bar.
///
/// `ema` is `None` until `period` days (including the bar's own, in progress)
/// have been observed. `reference` is `None` until the day `lookback_days`
/// back has a completed EMA.
pub fn daily_ema_columns(candles: &[Candle], period: usize, lookback_days: usize) -> DailyEmaColumns {
    let mut cols = DailyEmaColumns {
        ema: vec![None; candles.len()],
        reference: vec![None; candles.len()],
    };
    if period == 0 {
        return cols;
    }

    let mut state = DailyEma::new(period);
    let mut current_day: Option<i64> = None;
    let mut last_close = 0.0;

    for (i, candle) in candles.iter().enumerate() {
        let day = day_index(candle.open_time);
        if let Some(prev_day) = current_day {
            if day != prev_day {
                state.complete_day(last_close);
            }
        }
        current_day = Some(day);
        last_close = candle.close;
        cols.ema[i] = state.provisional(candle.close);
        cols.reference[i] = state.days_back(lookback_days);
    }

    cols
}

struct DailyEma {
    period: usize,
    multiplier: f64,
    seed_sum: f64,
    ema: Option<f64>,
    /// EMA after each completed day, oldest first.
    completed: Vec<Option<f64>>,
}

impl DailyEma {
    fn new(period: usize) -> Self {
        Self {
            period,
            multiplier: ema_multiplier(period),
            seed_sum: 0.0,
            ema: None,
            completed: Vec::new(),
        }
    }

    fn complete_day(&mut self, close: f64) {
        match self.ema {
            Some(prev) => self.ema = Some(self.step(prev, close)),
            None => {
                self.seed_sum += close;
                if self.completed.len() + 1 == self.period {
                    self.ema = Some(self.seed_sum / self.period as f64);
                }
            }
        }
        self.completed.push(self.ema.filter(|v| v.is_finite()));
    }

    fn provisional(&self, close: f64) -> Option<f64> {
        let value = match self.ema {
            Some(prev) => self.step(prev, close),
            None if self.completed.len() + 1 == self.period => {
                (self.seed_sum + close) / self.period as f64
            }
            None => return None,
        };
        value.is_finite().then_some(value)
    }

    /// Completed EMA of the day `days` before the one in progress.
    fn days_back(&self, days: usize) -> Option<f64> {
        if days == 0 {
            return None;
        }
        let idx = self.completed.len().checked_sub(days)?;
        self.completed[idx]
    }

    fn step(&self, prev: f64, close: f64) -> f64 {
        close * self.multiplier + prev * (1.0 - self.multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::ema_series;
    use crate::market_data::candle::test_candle;
    use crate::market_data::DAY_MS;

    #[test]
    fn daily_bars_match_plain_ema() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64 * 3.0).collect();
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| test_candle(i as i64 * DAY_MS, c))
            .collect();

        let daily = daily_ema_columns(&candles, 3, 1).ema;
        let plain = ema_series(&closes, 3);
        assert_eq!(daily.len(), plain.len());
        for (d, p) in daily.iter().zip(plain.iter()) {
            match (d, p) {
                (Some(a), Some(b)) => assert!((a - b).abs() < 1e-10, "{a} vs {b}"),
                (None, None) => {}
                other => panic!("mismatch {other:?}"),
            }
        }
    }

    #[test]
    fn intraday_bar_only_sees_its_own_close() {
        // Two bars per day. Day closes: 10, 20, then day 2 in progress.
        let half = DAY_MS / 2;
        let candles = vec![
            test_candle(0, 5.0),
            test_candle(half, 10.0),
            test_candle(DAY_MS, 15.0),
            test_candle(DAY_MS + half, 20.0),
            test_candle(2 * DAY_MS, 30.0),
            test_candle(2 * DAY_MS + half, 90.0),
        ];
        let series = daily_ema_columns(&candles, 2, 1).ema;

        // Day 0 is the first of two seed days.
        assert_eq!(series[0], None);
        assert_eq!(series[1], None);
        // Day 1 in progress: seed SMA of (10, close).
        assert!((series[2].unwrap() - 12.5).abs() < 1e-10);
        assert!((series[3].unwrap() - 15.0).abs() < 1e-10);
        // Day 2: step from the completed day-1 EMA (15) with m = 2/3.
        let m = 2.0 / 3.0;
        assert!((series[4].unwrap() - (30.0 * m + 15.0 * (1.0 - m))).abs() < 1e-10);
        assert!((series[5].unwrap() - (90.0 * m + 15.0 * (1.0 - m))).abs() < 1e-10);
    }

    #[test]
    fn empty_and_zero_period() {
        assert!(daily_ema_columns(&[], 3, 3).ema.is_empty());
        let candles = vec![test_candle(0, 1.0)];
        let cols = daily_ema_columns(&candles, 0, 3);
        assert_eq!(cols.ema, vec![None]);
        assert_eq!(cols.reference, vec![None]);
    }

    #[test]
    fn reference_is_counted_in_days_on_intraday_bars() {
        // Hourly bars, each day closing 10 higher than the last.
        let hour = DAY_MS / 24;
        let candles: Vec<Candle> = (0..5 * 24)
            .map(|h| test_candle(h * hour, 100.0 + (h / 24) as f64 * 10.0))
            .collect();
        let cols = daily_ema_columns(&candles, 1, 3);

        // A 1-day EMA is the day's close, so the reference is the close of
        // the day three days back, constant across the current day.
        for (i, candle) in candles.iter().enumerate() {
            let day = i / 24;
            assert_eq!(cols.ema[i], Some(candle.close));
            let expected = (day >= 3).then(|| 100.0 + (day - 3) as f64 * 10.0);
            assert_eq!(cols.reference[i], expected, "bar {i}");
        }
    }

    #[test]
    fn daily_bars_reference_matches_shift() {
        let closes: Vec<f64> = (1..=8).map(|x| x as f64).collect();
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| test_candle(i as i64 * DAY_MS, c))
            .collect();
        let cols = daily_ema_columns(&candles, 2, 3);
        for i in 0..candles.len() {
            let shifted = i.checked_sub(3).and_then(|j| cols.ema[j]);
            assert_eq!(cols.reference[i], shifted, "bar {i}");
        }
    }
}
