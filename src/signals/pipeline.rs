// =============================================================================
// Indicator & Signal Pipeline
// =============================================================================
//
// Two stages:
//   1. Series-wide indicator columns (EMA short/long, RSI, volume SMA, ATR,
//      optional trend EMA, daily EMA). These are inherently sequential.
//   2. A bar-local pure function that turns the columns at bar `i` (and a
//      few bars before it) into boolean signal flags.
//
// A bar without full indicator history never carries an entry flag.
// =============================================================================

use serde::Serialize;

use crate::indicators::{atr_series, ema_series, rsi_series, sma_series};
use crate::market_data::{interval_duration_ms, Candle, DAY_MS};
use crate::runtime_config::StrategyParams;
use crate::types::Side;

use super::daily::daily_ema_columns;

// =============================================================================
// Annotated bar
// =============================================================================

/// Indicator values at a single bar. `None` = not enough history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BarIndicators {
    pub ema_short: Option<f64>,
    pub ema_long: Option<f64>,
    pub rsi: Option<f64>,
    pub vol_sma: Option<f64>,
    pub atr: Option<f64>,
    pub ema_trend: Option<f64>,
    pub ema_daily: Option<f64>,
}

/// Signal flags derived for a single bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BarSignals {
    pub bullish_candle: bool,
    pub bearish_candle: bool,
    pub breakout_up: bool,
    pub breakout_down: bool,
    pub ema_cross_up: bool,
    pub ema_cross_down: bool,
    pub volume_surge: bool,
    pub daily_trend_up: bool,
    pub daily_trend_down: bool,
    pub enter_long: bool,
    pub enter_short: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatedBar {
    pub candle: Candle,
    pub indicators: BarIndicators,
    pub signals: BarSignals,
}

impl AnnotatedBar {
    /// Side of the entry signal on this bar, if any.
    pub fn entry_side(&self) -> Option<Side> {
        if self.signals.enter_long {
            Some(Side::Long)
        } else if self.signals.enter_short {
            Some(Side::Short)
        } else {
            None
        }
    }
}

// =============================================================================
// Indicator columns
// =============================================================================

/// Full-length indicator columns for a candle series.
#[derive(Debug, Clone)]
pub struct IndicatorColumns {
    pub ema_short: Vec<Option<f64>>,
    pub ema_long: Vec<Option<f64>>,
    pub rsi: Vec<Option<f64>>,
    pub vol_sma: Vec<Option<f64>>,
    pub atr: Vec<Option<f64>>,
    pub ema_trend: Vec<Option<f64>>,
    pub ema_daily: Vec<Option<f64>>,
    /// Completed daily EMA `daily_trend_lookback` days before each bar's day.
    pub ema_daily_reference: Vec<Option<f64>>,
}

impl IndicatorColumns {
    pub fn compute(candles: &[Candle], params: &StrategyParams) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let daily = daily_ema_columns(candles, params.ema_daily_len, params.daily_trend_lookback);

        Self {
            ema_short: ema_series(&closes, params.ema_short_len),
            ema_long: ema_series(&closes, params.ema_long_len),
            rsi: rsi_series(&closes, params.rsi_len),
            vol_sma: sma_series(&volumes, params.vol_sma_len),
            atr: atr_series(candles, params.atr_len),
            ema_trend: match params.ema_trend_filter_len {
                Some(len) => ema_series(&closes, len),
                None => vec![None; candles.len()],
            },
            ema_daily: daily.ema,
            ema_daily_reference: daily.reference,
        }
    }

    pub fn at(&self, i: usize) -> BarIndicators {
        BarIndicators {
            ema_short: self.ema_short[i],
            ema_long: self.ema_long[i],
            rsi: self.rsi[i],
            vol_sma: self.vol_sma[i],
            atr: self.atr[i],
            ema_trend: self.ema_trend[i],
            ema_daily: self.ema_daily[i],
        }
    }
}

// =============================================================================
// Pipeline entry points
// =============================================================================

/// Annotate every bar of `candles`. Pure and deterministic; short or empty
/// input yields bars without entry flags rather than an error.
pub fn annotate(candles: &[Candle], params: &StrategyParams) -> Vec<AnnotatedBar> {
    let cols = IndicatorColumns::compute(candles, params);
    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| AnnotatedBar {
            candle: candle.clone(),
            indicators: cols.at(i),
            signals: evaluate_bar(candles, &cols, i, params),
        })
        .collect()
}

/// Annotate only the newest bar. Used by live instances, which evaluate one
/// closed bar at a time over their rolling buffer.
pub fn annotate_last(candles: &[Candle], params: &StrategyParams) -> Option<AnnotatedBar> {
    let i = candles.len().checked_sub(1)?;
    let cols = IndicatorColumns::compute(candles, params);
    Some(AnnotatedBar {
        candle: candles[i].clone(),
        indicators: cols.at(i),
        signals: evaluate_bar(candles, &cols, i, params),
    })
}

/// Bars of history the pipeline needs before the newest bar can carry a
/// signal on `interval`. The daily EMA term dominates on intraday intervals.
pub fn required_history(params: &StrategyParams, interval: &str) -> usize {
    let intraday = [
        params.ema_short_len + 1,
        params.ema_long_len + 1,
        params.rsi_len + 1,
        params.vol_sma_len,
        params.atr_len + 1,
        params.ema_trend_filter_len.unwrap_or(0),
        params.breakout_window + 1,
    ]
    .into_iter()
    .max()
    .unwrap_or(0);

    let daily = match interval_duration_ms(interval) {
        Some(bar_ms) => {
            let bars_per_day = (DAY_MS / bar_ms).max(1) as usize;
            // One extra day for a partial first day in the buffer.
            (params.ema_daily_len + params.daily_trend_lookback + 1) * bars_per_day
        }
        None => 0,
    };

    intraday.max(daily)
}

// =============================================================================
// Bar-local signal rule
// =============================================================================

/// Derive the signal flags for bar `i` from the candles and indicator columns.
pub fn evaluate_bar(
    candles: &[Candle],
    cols: &IndicatorColumns,
    i: usize,
    params: &StrategyParams,
) -> BarSignals {
    let candle = &candles[i];
    let ind = cols.at(i);

    let (breakout_up, breakout_down) = breakout_flags(candles, i, params.breakout_window);

    let (ema_cross_up, ema_cross_down) = match i.checked_sub(1) {
        Some(prev) => match (
            cols.ema_short[prev],
            cols.ema_long[prev],
            ind.ema_short,
            ind.ema_long,
        ) {
            (Some(ps), Some(pl), Some(s), Some(l)) => (ps <= pl && s > l, ps >= pl && s < l),
            _ => (false, false),
        },
        None => (false, false),
    };

    let volume_surge = ind
        .vol_sma
        .map_or(false, |sma| candle.volume > sma * params.volume_surge_multiplier);

    let (rsi_long_ok, rsi_short_ok) = ind.rsi.map_or((false, false), |rsi| {
        (rsi > params.rsi_buy_threshold, rsi < params.rsi_sell_threshold)
    });

    let (daily_trend_up, daily_trend_down) = match (ind.ema_daily, cols.ema_daily_reference[i]) {
        (Some(now), Some(then)) => (now > then, now < then),
        _ => (false, false),
    };
    let (daily_permits_long, daily_permits_short) = match ind.ema_daily {
        Some(daily) => (
            daily_trend_up && candle.close > daily,
            daily_trend_down && candle.close < daily,
        ),
        None => (false, false),
    };

    let (trend_long_ok, trend_short_ok) = match params.ema_trend_filter_len {
        None => (true, true),
        Some(_) => ind
            .ema_trend
            .map_or((false, false), |t| (candle.close > t, candle.close < t)),
    };

    let bullish_candle = candle.is_bullish();
    let bearish_candle = candle.is_bearish();
    let has_history = has_full_history(&ind, params);

    let enter_long = has_history
        && ema_cross_up
        && breakout_up
        && volume_surge
        && rsi_long_ok
        && bullish_candle
        && daily_permits_long
        && trend_long_ok;

    let enter_short = has_history
        && ema_cross_down
        && breakout_down
        && volume_surge
        && rsi_short_ok
        && bearish_candle
        && daily_permits_short
        && trend_short_ok;

    BarSignals {
        bullish_candle,
        bearish_candle,
        breakout_up,
        breakout_down,
        ema_cross_up,
        ema_cross_down,
        volume_surge,
        daily_trend_up,
        daily_trend_down,
        enter_long,
        enter_short,
    }
}

/// Current high above the highest high (current low below the lowest low)
/// of the preceding `window` bars.
fn breakout_flags(candles: &[Candle], i: usize, window: usize) -> (bool, bool) {
    if window == 0 || i < window {
        return (false, false);
    }
    let prior = &candles[i - window..i];
    let highest = prior.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let lowest = prior.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let current = &candles[i];
    (current.high > highest, current.low < lowest)
}

fn has_full_history(ind: &BarIndicators, params: &StrategyParams) -> bool {
    let base = ind.ema_short.is_some()
        && ind.ema_long.is_some()
        && ind.rsi.is_some()
        && ind.vol_sma.is_some()
        && ind.atr.is_some()
        && ind.ema_daily.is_some();
    base && (params.ema_trend_filter_len.is_none() || ind.ema_trend.is_some())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle::test_candle;

    /// Small lookbacks so a handful of daily bars is enough history.
    fn tiny_params() -> StrategyParams {
        StrategyParams {
            ema_short_len: 2,
            ema_long_len: 4,
            rsi_len: 3,
            vol_sma_len: 3,
            atr_len: 3,
            ema_trend_filter_len: None,
            ema_daily_len: 2,
            breakout_window: 2,
            daily_trend_lookback: 1,
            ..StrategyParams::default()
        }
    }

    fn daily_bar(day: i64, open: f64, close: f64, volume: f64) -> Candle {
        Candle {
            interval: "1d".into(),
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            volume,
            ..test_candle(day * DAY_MS, close)
        }
    }

    /// Drifting lower, then one strong bullish bar on heavy volume.
    fn long_setup() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..8)
            .map(|d| {
                let close = 100.0 - d as f64 * 0.5 + if d % 2 == 0 { 0.3 } else { 0.0 };
                daily_bar(d, close + 0.2, close, 100.0)
            })
            .collect();
        candles.push(daily_bar(8, 97.0, 104.0, 400.0));
        candles
    }

    #[test]
    fn empty_and_short_input_do_not_panic() {
        let params = StrategyParams::default();
        assert!(annotate(&[], &params).is_empty());
        assert!(annotate_last(&[], &params).is_none());

        let short: Vec<Candle> = (0..5).map(|i| test_candle(i * 60_000, 100.0)).collect();
        let bars = annotate(&short, &params);
        assert_eq!(bars.len(), 5);
        assert!(bars.iter().all(|b| b.entry_side().is_none()));
    }

    #[test]
    fn strong_bullish_bar_enters_long() {
        let params = tiny_params();
        let candles = long_setup();
        let bars = annotate(&candles, &params);
        let last = bars.last().unwrap();

        assert!(last.signals.bullish_candle);
        assert!(last.signals.breakout_up);
        assert!(last.signals.volume_surge);
        assert!(last.signals.ema_cross_up);
        assert!(last.signals.daily_trend_up);
        assert!(last.signals.enter_long, "signals: {:?}", last.signals);
        assert!(!last.signals.enter_short);
        assert_eq!(last.entry_side(), Some(Side::Long));
    }

    #[test]
    fn annotate_last_matches_full_annotation() {
        let params = tiny_params();
        let candles = long_setup();
        let full = annotate(&candles, &params);
        let last = annotate_last(&candles, &params).unwrap();
        assert_eq!(&last, full.last().unwrap());
    }

    #[test]
    fn trend_filter_gates_long_entries() {
        let candles = long_setup();

        let mut params = tiny_params();
        params.ema_trend_filter_len = Some(4);
        let bar = annotate_last(&candles, &params).unwrap();
        assert!(bar.indicators.ema_trend.unwrap() < bar.candle.close);
        assert!(bar.signals.enter_long);

        // A 1-bar trend EMA equals the close, so "close above trend" fails.
        params.ema_trend_filter_len = Some(1);
        let bar = annotate_last(&candles, &params).unwrap();
        assert!(!bar.signals.enter_long);
    }

    #[test]
    fn breakout_requires_full_window() {
        let candles: Vec<Candle> = (0..3).map(|i| test_candle(i * 60_000, 100.0 + i as f64)).collect();
        assert_eq!(breakout_flags(&candles, 1, 2), (false, false));
        assert_eq!(breakout_flags(&candles, 2, 2), (true, false));
        assert_eq!(breakout_flags(&candles, 2, 0), (false, false));
    }

    #[test]
    fn ema_cross_is_edge_triggered() {
        let params = StrategyParams {
            ema_short_len: 1,
            ema_long_len: 3,
            ..tiny_params()
        };
        let closes = [10.0, 10.0, 10.0, 9.0, 12.0, 13.0];
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| test_candle(i as i64 * 60_000, c))
            .collect();
        let bars = annotate(&candles, &params);
        assert!(bars[3].signals.ema_cross_down);
        assert!(bars[4].signals.ema_cross_up);
        // Already above: no new cross.
        assert!(!bars[5].signals.ema_cross_up);
    }

    #[test]
    fn daily_trend_compares_days_not_bars_on_hourly_series() {
        let params = StrategyParams {
            daily_trend_lookback: 3,
            ..tiny_params()
        };
        let hour = DAY_MS / 24;
        // Ten days of hourly bars, each day 10 higher; the last three hours dip.
        let mut candles: Vec<Candle> = (0..10 * 24)
            .map(|h| test_candle(h * hour, 100.0 + (h / 24) as f64 * 10.0))
            .collect();
        let n = candles.len();
        for (k, candle) in candles[n - 3..].iter_mut().enumerate() {
            candle.close -= (k + 1) as f64;
        }

        let bars = annotate(&candles, &params);
        let last = bars.last().unwrap();
        let three_bars_back = bars[n - 4].indicators.ema_daily.unwrap();
        // The intraday dip pulls the provisional EMA below where it stood a
        // few bars ago, but the day-over-day trend is still up.
        assert!(last.indicators.ema_daily.unwrap() < three_bars_back);
        assert!(last.signals.daily_trend_up, "signals: {:?}", last.signals);
        assert!(!last.signals.daily_trend_down);
    }

    #[test]
    fn required_history_scales_with_interval() {
        let params = StrategyParams::default();
        assert_eq!(required_history(&params, "1d"), 200);
        // 15m: (20 + 3 + 1) days * 96 bars.
        assert_eq!(required_history(&params, "15m"), 24 * 96);
        assert_eq!(required_history(&params, "1h"), 24 * 24);
        // Calendar interval falls back to intraday lookbacks.
        assert_eq!(required_history(&params, "1M"), 200);
    }
}
