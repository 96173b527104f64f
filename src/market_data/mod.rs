pub mod candle;
pub mod live;
pub mod rolling;

pub use candle::{
    day_index, interval_duration_ms, is_supported_interval, merge_series, Candle, CandleKey, DAY_MS,
};
pub use live::{LiveCandle, LiveCandleStream};
pub use rolling::RollingBuffer;
