// =============================================================================
// Average True Range (ATR) - Wilder's Smoothing Method
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
//   ATR_0 = SMA of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::Candle;

/// True Range of `current` given the previous bar's close.
pub fn true_range(current: &Candle, prev_close: f64) -> f64 {
    let hl = current.high - current.low;
    let hc = (current.high - prev_close).abs();
    let lc = (current.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// ATR aligned to the input: `out[i]` is the ATR at `candles[i]`.
///
/// The first value sits at index `period` (each TR needs a previous close).
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` candles => all `None`
/// - A non-finite TR ends the series; later bars stay `None`.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; candles.len()];
    if period == 0 || candles.len() < period + 1 {
        return out;
    }

    let tr_values: Vec<f64> = candles
        .windows(2)
        .map(|w| true_range(&w[1], w[0].close))
        .collect();

    let period_f = period as f64;
    let mut atr = tr_values[..period].iter().sum::<f64>() / period_f;
    if !atr.is_finite() {
        return out;
    }
    out[period] = Some(atr);

    // tr_values[k] belongs to candles[k + 1].
    for (k, &tr) in tr_values.iter().enumerate().skip(period) {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            break;
        }
        out[k + 1] = Some(atr);
    }

    out
}

/// Most recent ATR value, or `None` with insufficient data.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period).last().copied().flatten()
}
