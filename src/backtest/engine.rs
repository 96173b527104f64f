use serde::Serialize;
use tracing::{debug, warn};

use super::book::{TradeBook, TradeRecord};
use crate::runtime_config::StrategyParams;
use crate::signals::AnnotatedBar;
use crate::types::ExitReason;

/// Result of one pass over an annotated series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestOutcome {
    pub trades: Vec<TradeRecord>,
    pub initial_capital: f64,
    pub final_capital: f64,
    /// Capital reached zero and the run stopped early; `trades` is partial.
    pub halted: bool,
    pub bars_processed: usize,
}

/// Walk `bars` as a single-position trade state machine.
///
/// Per bar: exits first (stop before target), then, when flat, an entry on
/// the same bar. A position still open after the last bar is closed at that
/// bar's close with [`ExitReason::EndOfData`].
pub fn run(bars: &[AnnotatedBar], params: &StrategyParams) -> BacktestOutcome {
    let mut book = TradeBook::new(params.initial_balance);
    let mut halted = false;
    let mut bars_processed = 0;

    for (i, bar) in bars.iter().enumerate() {
        if book.capital() <= 0.0 {
            halted = true;
            break;
        }
        bars_processed = i + 1;

        if let Some(trade) = book.check_exit(&bar.candle) {
            debug!(
                index = i,
                reason = %trade.exit_reason,
                pnl = trade.pnl,
                capital = trade.capital_after_trade,
                "position closed"
            );
        }
        if book.capital() <= 0.0 {
            halted = true;
            break;
        }

        if let Some(plan) = book.plan_entry(i, bar, params) {
            book.open(i, bar.candle.open_time, plan);
            debug!(
                index = i,
                side = %plan.side,
                entry = plan.entry_price,
                sl = plan.stop_loss,
                tp = plan.take_profit,
                size = plan.size,
                "position opened"
            );
        }
    }

    if halted {
        warn!(
            capital = book.capital(),
            bars_processed,
            trades = book.trades().len(),
            "capital exhausted, backtest halted"
        );
    } else if let Some(last) = bars.last() {
        book.force_close(last.candle.close, last.candle.open_time, ExitReason::EndOfData);
    }

    let final_capital = book.capital();
    BacktestOutcome {
        initial_capital: book.initial_capital(),
        final_capital,
        halted,
        bars_processed,
        trades: book.into_trades(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle::test_candle;
    use crate::market_data::Candle;
    use crate::signals::{BarIndicators, BarSignals};
    use crate::types::Side;

    fn quiet_bar(i: i64, low: f64, high: f64, close: f64) -> AnnotatedBar {
        AnnotatedBar {
            candle: Candle {
                open: close,
                high,
                low,
                close,
                ..test_candle(i * 60_000, close)
            },
            indicators: BarIndicators {
                atr: Some(2.0),
                ..BarIndicators::default()
            },
            signals: BarSignals::default(),
        }
    }

    fn signal_bar(i: i64, side: Side, close: f64, atr: Option<f64>) -> AnnotatedBar {
        let mut bar = quiet_bar(i, close - 0.5, close + 0.5, close);
        bar.indicators.atr = atr;
        match side {
            Side::Long => bar.signals.enter_long = true,
            Side::Short => bar.signals.enter_short = true,
        }
        bar
    }

    fn scenario_params() -> StrategyParams {
        StrategyParams {
            atr_multiplier_sl: 1.5,
            rr_factor_tp: 2.0,
            risk_percent_per_trade: 0.01,
            initial_balance: 10_000.0,
            ..StrategyParams::default()
        }
    }

    #[test]
    fn ten_bar_take_profit_scenario() {
        let mut bars: Vec<AnnotatedBar> =
            (0..10).map(|i| quiet_bar(i, 99.0, 101.0, 100.0)).collect();
        bars[5] = signal_bar(5, Side::Long, 100.0, Some(2.0));
        bars[6] = quiet_bar(6, 98.0, 103.0, 102.0);
        bars[7] = quiet_bar(7, 101.0, 107.0, 106.5);

        let outcome = run(&bars, &scenario_params());
        assert_eq!(outcome.trades.len(), 1);
        let t = &outcome.trades[0];
        assert_eq!(t.side, Side::Long);
        assert_eq!(t.exit_reason, ExitReason::TakeProfit);
        assert!((t.entry_price - 100.0).abs() < 1e-10);
        assert!((t.stop_loss - 97.0).abs() < 1e-10);
        assert!((t.take_profit - 106.0).abs() < 1e-10);
        assert!((t.size - 33.333_333_333).abs() < 1e-6);
        assert!((t.pnl - 200.0).abs() < 1e-6);
        assert!((t.capital_after_trade - 10_200.0).abs() < 1e-6);
        assert_eq!(t.entry_time, 5 * 60_000);
        assert_eq!(t.exit_time, 7 * 60_000);
        assert!((outcome.final_capital - 10_200.0).abs() < 1e-6);
        assert!(!outcome.halted);
    }

    #[test]
    fn nan_atr_never_opens_on_that_bar() {
        let mut bars: Vec<AnnotatedBar> =
            (0..6).map(|i| quiet_bar(i, 99.0, 101.0, 100.0)).collect();
        bars[2] = signal_bar(2, Side::Long, 100.0, Some(f64::NAN));
        bars[3] = signal_bar(3, Side::Short, 100.0, Some(0.0));
        bars[4] = signal_bar(4, Side::Long, 100.0, None);

        let outcome = run(&bars, &scenario_params());
        assert!(outcome.trades.is_empty());
        assert!((outcome.final_capital - 10_000.0).abs() < 1e-10);
    }

    #[test]
    fn open_position_closes_at_end_of_data() {
        let mut bars: Vec<AnnotatedBar> =
            (0..5).map(|i| quiet_bar(i, 99.0, 101.0, 100.0)).collect();
        bars[1] = signal_bar(1, Side::Short, 100.0, Some(2.0));
        bars[4] = quiet_bar(4, 98.0, 100.0, 99.0);

        let outcome = run(&bars, &scenario_params());
        assert_eq!(outcome.trades.len(), 1);
        let t = &outcome.trades[0];
        assert_eq!(t.exit_reason, ExitReason::EndOfData);
        assert_eq!(t.exit_time, 4 * 60_000);
        assert!((t.exit_price - 99.0).abs() < 1e-10);
        assert!(t.pnl > 0.0);
    }

    #[test]
    fn capital_is_conserved_across_trades() {
        // Alternate signals and stop-outs / targets to produce several trades.
        let mut bars = Vec::new();
        for k in 0..6 {
            let base = k * 6;
            let side = if k % 2 == 0 { Side::Long } else { Side::Short };
            bars.push(signal_bar(base, side, 100.0, Some(2.0)));
            bars.push(quiet_bar(base + 1, 99.0, 101.0, 100.0));
            // Even rounds hit the long target, odd rounds hit the short stop.
            bars.push(quiet_bar(base + 2, 99.5, 106.5, 100.0));
            for j in 3..6 {
                bars.push(quiet_bar(base + j, 99.0, 101.0, 100.0));
            }
        }

        let params = scenario_params();
        let outcome = run(&bars, &params);
        assert!(outcome.trades.len() >= 2);

        let mut prev = params.initial_balance;
        for t in &outcome.trades {
            assert!((t.capital_after_trade - (prev + t.pnl)).abs() < 1e-9);
            prev = t.capital_after_trade;
        }
        assert!((outcome.final_capital - prev).abs() < 1e-9);
    }

    #[test]
    fn never_more_than_one_open_position() {
        // Signal on every bar: entries only happen after each close.
        let bars: Vec<AnnotatedBar> = (0..40)
            .map(|i| {
                let mut b = signal_bar(i, Side::Long, 100.0, Some(2.0));
                if i % 7 == 3 {
                    b.candle.high = 107.0;
                }
                b
            })
            .collect();

        let outcome = run(&bars, &scenario_params());
        for pair in outcome.trades.windows(2) {
            assert!(pair[1].entry_time >= pair[0].exit_time);
        }
        assert!(!outcome.trades.is_empty());
    }

    #[test]
    fn cooldown_blocks_immediate_reentry() {
        let mut bars: Vec<AnnotatedBar> = (0..8)
            .map(|i| signal_bar(i, Side::Long, 100.0, Some(2.0)))
            .collect();
        // Target on bar 1 closes the first trade right away.
        bars[1].candle.high = 107.0;

        let outcome = run(&bars, &scenario_params());
        let entries: Vec<i64> = outcome.trades.iter().map(|t| t.entry_time / 60_000).collect();
        // Entered at 0; with min_bars_between_trades = 3 the next entry is bar 4.
        assert_eq!(entries, vec![0, 4]);
    }

    #[test]
    fn halts_when_capital_exhausted() {
        let params = StrategyParams {
            risk_percent_per_trade: 1.0,
            min_bars_between_trades: 0,
            initial_balance: 100.0,
            ..scenario_params()
        };
        // Entry at 100 with SL 97 risks the full balance; a gap down through
        // the stop fills at 97 and loses exactly it.
        let mut bars: Vec<AnnotatedBar> = (0..5)
            .map(|i| signal_bar(i, Side::Long, 100.0, Some(2.0)))
            .collect();
        bars[1].candle.low = 90.0;

        let outcome = run(&bars, &params);
        assert!(outcome.halted);
        assert_eq!(outcome.trades.len(), 1);
        assert!(outcome.final_capital <= 1e-9);
        assert_eq!(outcome.bars_processed, 2);
    }

    #[test]
    fn empty_series() {
        let outcome = run(&[], &scenario_params());
        assert!(outcome.trades.is_empty());
        assert_eq!(outcome.bars_processed, 0);
        assert!((outcome.final_capital - 10_000.0).abs() < 1e-10);
    }
}
