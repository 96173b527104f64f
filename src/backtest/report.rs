// =============================================================================
// Backtest runner - request -> cached candles -> annotate -> run -> report
// =============================================================================

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::engine::run;
use super::metrics::BacktestMetrics;
use super::TradeRecord;
use crate::candle_cache::{CandleCache, FetchSource};
use crate::error::ControlError;
use crate::market_data::is_supported_interval;
use crate::runtime_config::StrategyParams;
use crate::signals::annotate;
use crate::strategy::StrategyKind;
use crate::types::now_ms;

/// Lookback used when a request names neither dates nor a period.
pub const DEFAULT_PERIOD_DAYS: u32 = 90;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub symbol: String,
    pub strategy: String,
    pub timeframe: String,
    /// `YYYY-MM-DD` or RFC 3339. Must come with `end_date`.
    #[serde(default)]
    pub start_date: Option<String>,
    /// `YYYY-MM-DD` (inclusive, through the end of that day) or RFC 3339.
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub period_days: Option<u32>,
    /// Overrides the service-wide defaults when present.
    #[serde(default)]
    pub params: Option<StrategyParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestReport {
    pub symbol: String,
    pub strategy: String,
    pub interval: String,
    /// Open time of the first candle used, or the requested start when no
    /// data was available.
    pub data_start: i64,
    pub data_end: i64,
    pub candles: usize,
    pub data_source: FetchSource,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub trades: Vec<TradeRecord>,
    pub metrics: BacktestMetrics,
    /// Capital reached zero before the last bar.
    pub halted: bool,
    pub data_unavailable: bool,
    pub params: StrategyParams,
}

// ---------------------------------------------------------------------------
// Range resolution
// ---------------------------------------------------------------------------

/// Resolve the requested window to `[start_ms, end_ms]`.
pub fn resolve_range(request: &BacktestRequest, now: i64) -> Result<(i64, i64), ControlError> {
    let (start, end) = match (&request.start_date, &request.end_date, request.period_days) {
        (Some(_), Some(_), Some(_)) => {
            return Err(ControlError::InvalidRequest(
                "give either start_date/end_date or period_days, not both".into(),
            ))
        }
        (Some(start), Some(end), None) => (parse_date(start, false)?, parse_date(end, true)?),
        (Some(_), None, _) | (None, Some(_), _) => {
            return Err(ControlError::InvalidRequest(
                "start_date and end_date must be given together".into(),
            ))
        }
        (None, None, period) => {
            let days = period.unwrap_or(DEFAULT_PERIOD_DAYS);
            if days == 0 {
                return Err(ControlError::InvalidRequest("period_days must be at least 1".into()));
            }
            (now - Duration::days(i64::from(days)).num_milliseconds(), now)
        }
    };

    if start >= end {
        return Err(ControlError::InvalidRequest(format!(
            "start ({start}) must be before end ({end})"
        )));
    }
    Ok((start, end))
}

/// Bare dates are midnight UTC, or the last millisecond of the day when
/// `end_of_day` is set.
fn parse_date(value: &str, end_of_day: bool) -> Result<i64, ControlError> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| ControlError::InvalidRequest(format!("invalid date: {value}")))?
            .and_utc()
            .timestamp_millis();
        return Ok(if end_of_day {
            midnight + Duration::days(1).num_milliseconds() - 1
        } else {
            midnight
        });
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|e| ControlError::InvalidRequest(format!("invalid date {value}: {e}")))
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub async fn run_backtest(
    cache: &CandleCache,
    request: &BacktestRequest,
    defaults: &StrategyParams,
) -> Result<BacktestReport, ControlError> {
    run_backtest_at(cache, request, defaults, now_ms()).await
}

pub async fn run_backtest_at(
    cache: &CandleCache,
    request: &BacktestRequest,
    defaults: &StrategyParams,
    now: i64,
) -> Result<BacktestReport, ControlError> {
    let strategy = StrategyKind::from_name(&request.strategy)?;
    let params = request.params.clone().unwrap_or_else(|| defaults.clone());
    params
        .validate()
        .map_err(|e| ControlError::InvalidRequest(e.to_string()))?;
    if !is_supported_interval(&request.timeframe) {
        return Err(ControlError::InvalidRequest(format!(
            "unsupported timeframe: {:?}",
            request.timeframe
        )));
    }
    let (start, end) = resolve_range(request, now)?;
    let symbol = request.symbol.to_uppercase();

    let fetched = cache.fetch_at(&symbol, &request.timeframe, start, Some(end), now).await;
    if fetched.data_unavailable() {
        warn!(
            symbol = %symbol,
            interval = %request.timeframe,
            start,
            end,
            source = %fetched.source,
            "no candles for backtest window"
        );
        return Ok(BacktestReport {
            symbol,
            strategy: strategy.name().to_string(),
            interval: request.timeframe.clone(),
            data_start: start,
            data_end: end,
            candles: 0,
            data_source: fetched.source,
            initial_capital: params.initial_balance,
            final_capital: params.initial_balance,
            trades: Vec::new(),
            metrics: BacktestMetrics::compute(&[], params.initial_balance),
            halted: false,
            data_unavailable: true,
            params,
        });
    }

    let candles = fetched.candles;
    let bars = annotate(&candles, &params);
    let outcome = run(&bars, &params);
    let metrics = BacktestMetrics::compute(&outcome.trades, outcome.initial_capital);

    info!(
        symbol = %symbol,
        strategy = %strategy,
        interval = %request.timeframe,
        candles = candles.len(),
        trades = outcome.trades.len(),
        final_capital = outcome.final_capital,
        halted = outcome.halted,
        "backtest complete"
    );

    Ok(BacktestReport {
        symbol,
        strategy: strategy.name().to_string(),
        interval: request.timeframe.clone(),
        data_start: candles.first().map_or(start, |c| c.open_time),
        data_end: candles.last().map_or(end, |c| c.open_time),
        candles: candles.len(),
        data_source: fetched.source,
        initial_capital: outcome.initial_capital,
        final_capital: outcome.final_capital,
        trades: outcome.trades,
        metrics,
        halted: outcome.halted,
        data_unavailable: false,
        params,
    })
}
