// =============================================================================
// Broadcast - best-effort fan-out of candle and trade events
// =============================================================================
//
// Publishing never blocks and never fails: each subscriber owns an unbounded
// channel, and a subscriber whose channel is closed is unregistered on the
// next publish.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::backtest::TradeRecord;
use crate::execution::{OrderAck, OrderLeg};
use crate::market_data::LiveCandle;
use crate::types::{ExitReason, InstanceKey};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BroadcastEvent {
    Candle(CandleEvent),
    TradeEvent(TradeEvent),
}

/// Every live kline message, closed or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleEvent {
    pub instance: String,
    pub symbol: String,
    pub interval: String,
    pub is_closed: bool,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl CandleEvent {
    pub fn new(key: &InstanceKey, candle: &LiveCandle) -> Self {
        Self {
            instance: key.to_string(),
            symbol: candle.symbol.clone(),
            interval: candle.interval.clone(),
            is_closed: candle.is_closed,
            open_time: candle.open_time,
            close_time: candle.close_time,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TradeEventKind {
    /// An order leg was acknowledged by the execution provider.
    Order,
    /// The live position was closed by its stop, its target, or a stop
    /// request.
    PositionClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeEvent {
    pub instance: String,
    pub symbol: String,
    pub event: TradeEventKind,
    pub leg: Option<OrderLeg>,
    pub order_id: Option<String>,
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub status: String,
    pub timestamp: i64,
    pub pnl: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    /// Live capital once a closed position is booked.
    pub capital_after: Option<f64>,
}

impl TradeEvent {
    pub fn order(key: &InstanceKey, ack: &OrderAck) -> Self {
        Self {
            instance: key.to_string(),
            symbol: key.symbol.clone(),
            event: TradeEventKind::Order,
            leg: Some(ack.leg),
            order_id: Some(ack.order_id.clone()),
            side: ack.side.clone(),
            price: ack.price,
            quantity: ack.quantity,
            status: ack.status.clone(),
            timestamp: ack.timestamp,
            pnl: None,
            exit_reason: None,
            capital_after: None,
        }
    }

    pub fn position_closed(key: &InstanceKey, trade: &TradeRecord) -> Self {
        Self {
            instance: key.to_string(),
            symbol: key.symbol.clone(),
            event: TradeEventKind::PositionClosed,
            leg: None,
            order_id: None,
            side: trade.side.exit_order_side().to_string(),
            price: trade.exit_price,
            quantity: trade.size,
            status: "CLOSED".to_string(),
            timestamp: trade.exit_time,
            pnl: Some(trade.pnl),
            exit_reason: Some(trade.exit_reason),
            capital_after: Some(trade.capital_after_trade),
        }
    }
}

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

pub trait BroadcastSink: Send + Sync {
    /// Deliver `event` to every current subscriber. Must not block.
    fn publish(&self, event: &BroadcastEvent);
}

// ---------------------------------------------------------------------------
// In-process broadcaster
// ---------------------------------------------------------------------------

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<BroadcastEvent>,
}

#[derive(Default)]
pub struct Broadcaster {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Events arrive on the returned receiver until it
    /// is dropped.
    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<BroadcastEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber { id, tx });
        debug!(subscriber = id, "broadcast subscriber registered");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl BroadcastSink for Broadcaster {
    fn publish(&self, event: &BroadcastEvent) {
        let dead: Vec<u64> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.tx.send(event.clone()).is_err())
            .map(|s| s.id)
            .collect();

        if !dead.is_empty() {
            self.subscribers.write().retain(|s| !dead.contains(&s.id));
            debug!(dropped = dead.len(), "broadcast subscribers unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle::test_candle;
    use crate::types::Side;

    fn candle_event() -> BroadcastEvent {
        let key = InstanceKey::new("BTCUSDT", "scalping-lp", "1m");
        let live = LiveCandle::from_candle(&test_candle(0, 100.0), false);
        BroadcastEvent::Candle(CandleEvent::new(&key, &live))
    }

    #[test]
    fn delivers_to_all_subscribers() {
        let hub = Broadcaster::new();
        let (_, mut a) = hub.subscribe();
        let (_, mut b) = hub.subscribe();

        hub.publish(&candle_event());
        assert_eq!(a.try_recv().unwrap(), candle_event());
        assert_eq!(b.try_recv().unwrap(), candle_event());
    }

    #[test]
    fn closed_subscriber_is_unregistered() {
        let hub = Broadcaster::new();
        let (_, a) = hub.subscribe();
        let (_, mut b) = hub.subscribe();
        drop(a);

        hub.publish(&candle_event());
        assert_eq!(hub.subscriber_count(), 1);
        assert!(b.try_recv().is_ok());
    }

    #[test]
    fn events_are_tagged_by_type() {
        let json = serde_json::to_value(candle_event()).unwrap();
        assert_eq!(json["type"], "candle");
        assert_eq!(json["is_closed"], false);

        let key = InstanceKey::new("BTCUSDT", "scalping-lp", "1m");
        let trade = TradeRecord {
            entry_time: 0,
            exit_time: 60_000,
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 106.0,
            stop_loss: 97.0,
            take_profit: 106.0,
            size: 1.0,
            pnl: 6.0,
            capital_after_trade: 10_006.0,
            exit_reason: ExitReason::TakeProfit,
        };
        let json =
            serde_json::to_value(BroadcastEvent::TradeEvent(TradeEvent::position_closed(&key, &trade)))
                .unwrap();
        assert_eq!(json["type"], "trade-event");
        assert_eq!(json["event"], "position-closed");
        assert_eq!(json["exit_reason"], "TAKE_PROFIT");
        assert_eq!(json["side"], "SELL");
    }
}
