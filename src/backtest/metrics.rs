// =============================================================================
// Performance metrics - pure post-processing over a closed-trade list
// =============================================================================

use serde::{Serialize, Serializer};

use super::book::TradeRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate_percent: f64,
    pub total_pnl: f64,
    pub average_pnl_per_trade: f64,
    /// Gross profit / gross loss. Infinite with profits and no losses,
    /// serialised as the string `"Infinity"`.
    #[serde(serialize_with = "serialize_profit_factor")]
    pub profit_factor: f64,
    pub max_drawdown_percent: f64,
    pub average_win_amount: f64,
    /// Absolute value of the mean losing trade.
    pub average_loss_amount: f64,
    pub expectancy: f64,
}

fn serialize_profit_factor<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_infinite() {
        serializer.serialize_str("Infinity")
    } else {
        serializer.serialize_f64(*value)
    }
}

impl BacktestMetrics {
    pub fn compute(trades: &[TradeRecord], initial_capital: f64) -> Self {
        let total_trades = trades.len();
        if total_trades == 0 {
            return Self::empty();
        }

        let wins: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p < 0.0).collect();

        let total = total_trades as f64;
        let win_rate = wins.len() as f64 / total;
        let loss_rate = losses.len() as f64 / total;
        let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().sum::<f64>().abs();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let average_win_amount = mean(&wins);
        let average_loss_amount = mean(&losses).abs();

        Self {
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate_percent: win_rate * 100.0,
            total_pnl,
            average_pnl_per_trade: total_pnl / total,
            profit_factor,
            max_drawdown_percent: max_drawdown_percent(trades, initial_capital),
            average_win_amount,
            average_loss_amount,
            expectancy: win_rate * average_win_amount - loss_rate * average_loss_amount,
        }
    }

    fn empty() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate_percent: 0.0,
            total_pnl: 0.0,
            average_pnl_per_trade: 0.0,
            profit_factor: 0.0,
            max_drawdown_percent: 0.0,
            average_win_amount: 0.0,
            average_loss_amount: 0.0,
            expectancy: 0.0,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Deepest peak-to-trough fall of `[initial, capital_after_trade...]`, in
/// percent of the running peak.
fn max_drawdown_percent(trades: &[TradeRecord], initial_capital: f64) -> f64 {
    let mut peak = initial_capital;
    let mut max_dd = 0.0_f64;
    for capital in trades.iter().map(|t| t.capital_after_trade) {
        if capital > peak {
            peak = capital;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - capital) / peak);
        }
    }
    max_dd * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side};

    fn trades_from_pnls(initial: f64, pnls: &[f64]) -> Vec<TradeRecord> {
        let mut capital = initial;
        pnls.iter()
            .enumerate()
            .map(|(i, &pnl)| {
                capital += pnl;
                TradeRecord {
                    entry_time: i as i64,
                    exit_time: i as i64 + 1,
                    side: Side::Long,
                    entry_price: 100.0,
                    exit_price: 100.0,
                    stop_loss: 97.0,
                    take_profit: 106.0,
                    size: 1.0,
                    pnl,
                    capital_after_trade: capital,
                    exit_reason: if pnl > 0.0 {
                        ExitReason::TakeProfit
                    } else {
                        ExitReason::StopLoss
                    },
                }
            })
            .collect()
    }

    #[test]
    fn mixed_trades() {
        let trades = trades_from_pnls(1_000.0, &[100.0, -50.0, 200.0, -150.0]);
        let m = BacktestMetrics::compute(&trades, 1_000.0);

        assert_eq!(m.total_trades, 4);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 2);
        assert!((m.win_rate_percent - 50.0).abs() < 1e-10);
        assert!((m.total_pnl - 100.0).abs() < 1e-10);
        assert!((m.average_pnl_per_trade - 25.0).abs() < 1e-10);
        assert!((m.profit_factor - 1.5).abs() < 1e-10);
        assert!((m.average_win_amount - 150.0).abs() < 1e-10);
        assert!((m.average_loss_amount - 100.0).abs() < 1e-10);
        assert!((m.expectancy - 25.0).abs() < 1e-10);
        // Peak 1250 -> 1100.
        assert!((m.max_drawdown_percent - 12.0).abs() < 1e-10);
    }

    #[test]
    fn only_wins_gives_infinite_profit_factor() {
        let trades = trades_from_pnls(1_000.0, &[10.0, 20.0]);
        let m = BacktestMetrics::compute(&trades, 1_000.0);
        assert!(m.profit_factor.is_infinite());
        assert_eq!(m.max_drawdown_percent, 0.0);

        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["profit_factor"], "Infinity");
    }

    #[test]
    fn breakeven_only_gives_zero_profit_factor() {
        let trades = trades_from_pnls(1_000.0, &[0.0, 0.0]);
        let m = BacktestMetrics::compute(&trades, 1_000.0);
        assert_eq!(m.profit_factor, 0.0);
        assert_eq!(m.winning_trades, 0);
        assert_eq!(m.losing_trades, 0);
    }

    #[test]
    fn empty_trade_list() {
        let m = BacktestMetrics::compute(&[], 1_000.0);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.profit_factor, 0.0);
        assert_eq!(serde_json::to_value(&m).unwrap()["profit_factor"], 0.0);
    }

    #[test]
    fn drawdown_from_initial_capital() {
        let trades = trades_from_pnls(1_000.0, &[-200.0, 100.0]);
        let m = BacktestMetrics::compute(&trades, 1_000.0);
        assert!((m.max_drawdown_percent - 20.0).abs() < 1e-10);
    }
}
