// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator implementations. Series functions return
// one `Option<f64>` per input bar so that columns line up with the candle
// series; `None` marks bars without enough history.

pub mod atr;
pub mod ema;
pub mod rsi;
pub mod sma;

pub use atr::atr_series;
pub use ema::{calculate_ema, ema_multiplier, ema_series};
pub use rsi::rsi_series;
pub use sma::sma_series;

/// Place a compact indicator output (whose first value belongs to input index
/// `offset`) onto a full-length column.
pub(crate) fn align(len: usize, offset: usize, values: Vec<f64>) -> Vec<Option<f64>> {
    let mut out = vec![None; len];
    for (i, v) in values.into_iter().enumerate() {
        if let Some(slot) = out.get_mut(offset + i) {
            *slot = Some(v);
        }
    }
    out
}
