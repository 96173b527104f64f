/// Simple moving average aligned to the input; `out[i]` averages
/// `values[i + 1 - period ..= i]`.
///
/// A NaN poisons only the windows that contain it.
pub fn sma_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let period_f = period as f64;
    for (i, window) in values.windows(period).enumerate() {
        let mean = window.iter().sum::<f64>() / period_f;
        if mean.is_finite() {
            out[i + period - 1] = Some(mean);
        }
    }
    out
}
