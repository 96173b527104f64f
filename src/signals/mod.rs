// =============================================================================
// Signals Module
// =============================================================================
//
// Candle series -> annotated series:
// - Indicator columns and the bar-local entry rule (pipeline)
// - Daily EMA projected onto intraday bars (daily)

pub mod daily;
pub mod pipeline;

pub use daily::{daily_ema_columns, DailyEmaColumns};
pub use pipeline::{
    annotate, annotate_last, evaluate_bar, required_history, AnnotatedBar, BarIndicators,
    BarSignals, IndicatorColumns,
};
