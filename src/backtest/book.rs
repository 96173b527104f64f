// =============================================================================
// Trade Book - single-position trade state machine
// =============================================================================
//
// Shared by the backtest engine and live instances. Holds at most one open
// position, the running capital, and the closed-trade log.
//
//   flat --(entry plan accepted)--> open --(SL / TP / forced)--> flat
//
// Exit checks look at the bar's low/high. Stop-loss is checked before
// take-profit, so a bar that touches both counts as a stop.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::Candle;
use crate::runtime_config::StrategyParams;
use crate::signals::AnnotatedBar;
use crate::types::{ExitReason, Side};

/// Distances below this are treated as zero.
const PRICE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub entry_time: i64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
}

impl Position {
    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) * self.size * self.side.sign()
    }

    /// Exit level touched by `candle`, stop-loss first.
    pub fn exit_hit(&self, candle: &Candle) -> Option<(f64, ExitReason)> {
        let (stop_hit, target_hit) = match self.side {
            Side::Long => (
                candle.low <= self.stop_loss,
                candle.high >= self.take_profit,
            ),
            Side::Short => (
                candle.high >= self.stop_loss,
                candle.low <= self.take_profit,
            ),
        };
        if stop_hit {
            Some((self.stop_loss, ExitReason::StopLoss))
        } else if target_hit {
            Some((self.take_profit, ExitReason::TakeProfit))
        } else {
            None
        }
    }
}

/// A closed trade. Immutable once appended to the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_time: i64,
    pub exit_time: i64,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
    pub pnl: f64,
    pub capital_after_trade: f64,
    pub exit_reason: ExitReason,
}

/// Levels and size for a prospective entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryPlan {
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
}

impl EntryPlan {
    /// Stop and target from ATR, size from the capital at risk.
    ///
    /// Returns `None` when the ATR is missing/zero, the stop distance is
    /// degenerate, the size falls under the minimum, or the levels land on
    /// the wrong side of entry.
    pub fn from_atr(
        side: Side,
        entry_price: f64,
        atr: Option<f64>,
        capital: f64,
        params: &StrategyParams,
    ) -> Option<Self> {
        let atr = atr.filter(|a| a.is_finite() && a.abs() > PRICE_EPSILON)?;

        let stop_distance = atr * params.atr_multiplier_sl;
        let target_distance = stop_distance * params.rr_factor_tp;
        let (stop_loss, take_profit) = match side {
            Side::Long => (entry_price - stop_distance, entry_price + target_distance),
            Side::Short => (entry_price + stop_distance, entry_price - target_distance),
        };

        let levels_ok = match side {
            Side::Long => stop_loss < entry_price && take_profit > entry_price,
            Side::Short => stop_loss > entry_price && take_profit < entry_price,
        };
        if !levels_ok {
            return None;
        }

        let risk_per_unit = (entry_price - stop_loss).abs();
        if risk_per_unit <= PRICE_EPSILON {
            return None;
        }
        let size = capital * params.risk_percent_per_trade / risk_per_unit;
        if !size.is_finite() || size < params.min_position_size {
            return None;
        }

        Some(Self {
            side,
            entry_price,
            stop_loss,
            take_profit,
            size,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TradeBook {
    initial_capital: f64,
    capital: f64,
    position: Option<Position>,
    last_entry_index: Option<usize>,
    trades: Vec<TradeRecord>,
}

impl TradeBook {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            capital: initial_capital,
            position: None,
            last_entry_index: None,
            trades: Vec::new(),
        }
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn into_trades(self) -> Vec<TradeRecord> {
        self.trades
    }

    /// Whether bar `index` is past the cooldown since the last entry.
    pub fn cooldown_elapsed(&self, index: usize, min_bars_between_trades: usize) -> bool {
        match self.last_entry_index {
            Some(last) => index.saturating_sub(last) > min_bars_between_trades,
            None => true,
        }
    }

    /// Close the open position if `candle` touches its stop or target.
    pub fn check_exit(&mut self, candle: &Candle) -> Option<&TradeRecord> {
        let (price, reason) = self.position.as_ref()?.exit_hit(candle)?;
        self.close(price, candle.open_time, reason)
    }

    /// Evaluate an entry on bar `index` of an annotated series.
    ///
    /// Only meaningful while flat. Skips (with a debug log) when the bar has
    /// no signal, the cooldown is still running, or sizing rejects it.
    pub fn plan_entry(
        &self,
        index: usize,
        bar: &AnnotatedBar,
        params: &StrategyParams,
    ) -> Option<EntryPlan> {
        if !self.is_flat() || self.capital <= 0.0 {
            return None;
        }
        let side = bar.entry_side()?;
        if !self.cooldown_elapsed(index, params.min_bars_between_trades) {
            debug!(index, %side, "entry skipped: cooldown");
            return None;
        }

        let atr = bar.indicators.atr;
        let plan = EntryPlan::from_atr(side, bar.candle.close, atr, self.capital, params);
        if plan.is_none() {
            debug!(
                index,
                %side,
                atr = ?atr,
                capital = self.capital,
                "entry skipped: invalid ATR or sizing"
            );
        }
        plan
    }

    /// Open a position from an accepted plan. Ignored if one is already open.
    pub fn open(&mut self, index: usize, entry_time: i64, plan: EntryPlan) -> bool {
        if self.position.is_some() {
            return false;
        }
        self.position = Some(Position {
            side: plan.side,
            entry_time,
            entry_price: plan.entry_price,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            size: plan.size,
        });
        self.last_entry_index = Some(index);
        true
    }

    /// Close any open position at `price` regardless of its levels.
    pub fn force_close(
        &mut self,
        price: f64,
        exit_time: i64,
        reason: ExitReason,
    ) -> Option<&TradeRecord> {
        self.close(price, exit_time, reason)
    }

    fn close(&mut self, exit_price: f64, exit_time: i64, reason: ExitReason) -> Option<&TradeRecord> {
        let position = self.position.take()?;
        let pnl = position.pnl_at(exit_price);
        self.capital += pnl;
        self.trades.push(TradeRecord {
            entry_time: position.entry_time,
            exit_time,
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            size: position.size,
            pnl,
            capital_after_trade: self.capital,
            exit_reason: reason,
        });
        self.trades.last()
    }
}
