// =============================================================================
// Execution - bracket order placement behind a provider trait
// =============================================================================
//
// A bracket is three legs: the entry, a reduce-only stop, and a reduce-only
// take-profit. Quantisation of price and quantity to venue rules belongs to
// the provider; callers pass raw values.
// =============================================================================

use async_trait::async_trait;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::types::{now_ms, Side};

// ---------------------------------------------------------------------------
// Order types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderLeg {
    Entry,
    StopLoss,
    TakeProfit,
    /// Market order that flattens a position outside the bracket.
    Close,
}

impl std::fmt::Display for OrderLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "ENTRY"),
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::TakeProfit => write!(f, "TAKE_PROFIT"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// Acknowledgement of a single order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub leg: OrderLeg,
    pub order_id: String,
    /// `"BUY"` or `"SELL"`.
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub status: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketOrder {
    pub entry: OrderAck,
    pub stop: OrderAck,
    pub target: OrderAck,
}

impl BracketOrder {
    pub fn legs(&self) -> [&OrderAck; 3] {
        [&self.entry, &self.stop, &self.target]
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    /// Place entry + stop + target for a new position.
    async fn place_bracket_order(
        &self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        quantity: f64,
    ) -> Result<BracketOrder>;

    /// Cancel resting orders for `symbol` and flatten a position of
    /// `quantity` opened in direction `side`.
    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reference_price: f64,
    ) -> Result<OrderAck>;
}

// ---------------------------------------------------------------------------
// Paper execution
// ---------------------------------------------------------------------------

/// Fills every order locally at the requested price. Never touches the
/// network.
#[derive(Debug, Default, Clone)]
pub struct PaperExecution;

impl PaperExecution {
    pub fn new() -> Self {
        Self
    }

    fn ack(leg: OrderLeg, side: &str, price: f64, quantity: f64, status: &str) -> OrderAck {
        OrderAck {
            leg,
            order_id: format!("paper-{}", Uuid::new_v4()),
            side: side.to_string(),
            price,
            quantity,
            status: status.to_string(),
            timestamp: now_ms(),
        }
    }
}

#[async_trait]
impl ExecutionProvider for PaperExecution {
    async fn place_bracket_order(
        &self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        quantity: f64,
    ) -> Result<BracketOrder> {
        let bracket = BracketOrder {
            entry: Self::ack(OrderLeg::Entry, side.entry_order_side(), entry_price, quantity, "FILLED"),
            stop: Self::ack(OrderLeg::StopLoss, side.exit_order_side(), stop_loss, quantity, "NEW"),
            target: Self::ack(OrderLeg::TakeProfit, side.exit_order_side(), take_profit, quantity, "NEW"),
        };
        info!(
            symbol,
            %side,
            entry_price,
            stop_loss,
            take_profit,
            quantity,
            order_id = %bracket.entry.order_id,
            "paper bracket filled"
        );
        Ok(bracket)
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reference_price: f64,
    ) -> Result<OrderAck> {
        let ack = Self::ack(OrderLeg::Close, side.exit_order_side(), reference_price, quantity, "FILLED");
        info!(symbol, %side, quantity, price = reference_price, "paper position closed");
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paper_bracket_has_three_legs_with_opposing_sides() {
        let exec = PaperExecution::new();
        let bracket = exec
            .place_bracket_order("BTCUSDT", Side::Long, 100.0, 97.0, 106.0, 0.5)
            .await
            .unwrap();

        assert_eq!(bracket.entry.leg, OrderLeg::Entry);
        assert_eq!(bracket.entry.side, "BUY");
        assert_eq!(bracket.stop.side, "SELL");
        assert_eq!(bracket.target.side, "SELL");
        assert!((bracket.stop.price - 97.0).abs() < 1e-10);
        assert!((bracket.target.price - 106.0).abs() < 1e-10);
        assert!(bracket.legs().iter().all(|l| (l.quantity - 0.5).abs() < 1e-10));
        assert_ne!(bracket.entry.order_id, bracket.stop.order_id);
    }

    #[tokio::test]
    async fn paper_close_uses_exit_side() {
        let ack = PaperExecution::new()
            .close_position("ETHUSDT", Side::Short, 2.0, 1_500.0)
            .await
            .unwrap();
        assert_eq!(ack.leg, OrderLeg::Close);
        assert_eq!(ack.side, "BUY");
    }

    #[test]
    fn leg_serialises_screaming_case() {
        assert_eq!(serde_json::to_string(&OrderLeg::StopLoss).unwrap(), "\"STOP_LOSS\"");
    }
}
