// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// Smoothing multiplier for an EMA of `period` (0.0 for a zero period).
pub fn ema_multiplier(period: usize) -> f64 {
    if period == 0 {
        return 0.0;
    }
    2.0 / (period as f64 + 1.0)
}

/// Compute the EMA series for `closes` and look-back `period`.
///
/// Each output element corresponds to a close starting at index `period - 1`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period` => empty vec
/// - A non-finite intermediate value truncates the series.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    let multiplier = ema_multiplier(period);

    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// EMA aligned to the input: `out[i]` is the EMA at `closes[i]`, `None`
/// while there is not yet `period` bars of history.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    super::align(closes.len(), period.saturating_sub(1), calculate_ema(closes, period))
}
