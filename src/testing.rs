//! In-memory fakes for the provider, execution and broadcast seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broadcast::{BroadcastEvent, BroadcastSink};
use crate::execution::{BracketOrder, ExecutionProvider, OrderAck, PaperExecution};
use crate::market_data::{Candle, LiveCandle, LiveCandleStream};
use crate::provider::MarketDataProvider;
use crate::store::CandleStore;
use crate::types::Side;

pub(crate) type HistoryCall = (String, String, i64, Option<i64>);

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Serves a fixed history and hands out live feeds queued by the test.
pub(crate) struct FakeProvider {
    history: Vec<Candle>,
    calls: Mutex<Vec<HistoryCall>>,
    fail_history: AtomicBool,
    live_feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<LiveCandle>>>>,
    subscriptions: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn with_history(history: Vec<Candle>) -> Self {
        Self {
            history,
            calls: Mutex::new(Vec::new()),
            fail_history: AtomicBool::new(false),
            live_feeds: Mutex::new(VecDeque::new()),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub(crate) fn history_calls(&self) -> Vec<HistoryCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn set_history_failure(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Queue a live feed for the next `subscribe_live` call. The sender
    /// reports closed once the subscriber drops the stream.
    pub(crate) fn live_feed(&self) -> mpsc::UnboundedSender<Result<LiveCandle>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.live_feeds.lock().push_back(rx);
        tx
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataProvider for FakeProvider {
    async fn historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        self.calls
            .lock()
            .push((symbol.to_string(), interval.to_string(), start_ms, end_ms));
        if self.fail_history.load(Ordering::SeqCst) {
            bail!("provider unavailable");
        }
        let end = end_ms.unwrap_or(i64::MAX);
        Ok(self
            .history
            .iter()
            .filter(|c| c.symbol == symbol && c.interval == interval)
            .filter(|c| c.open_time >= start_ms && c.open_time <= end)
            .cloned()
            .collect())
    }

    async fn subscribe_live(&self, _symbol: &str, _interval: &str) -> Result<LiveCandleStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let feed = self.live_feeds.lock().pop_front();
        match feed {
            Some(rx) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => Ok(futures_util::stream::pending().boxed()),
        }
    }
}

/// A store whose every operation fails.
pub(crate) struct FailingStore;

impl CandleStore for FailingStore {
    fn upsert_ignore_duplicates(&self, _candles: &[Candle]) -> Result<usize> {
        bail!("disk full")
    }

    fn query_range(
        &self,
        _symbol: &str,
        _interval: &str,
        _start: i64,
        _end: Option<i64>,
    ) -> Result<Vec<Candle>> {
        bail!("database is locked")
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BracketRequest {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: f64,
}

/// Records every request and fills it through [`PaperExecution`].
#[derive(Default)]
pub(crate) struct RecordingExecution {
    brackets: Mutex<Vec<BracketRequest>>,
    closes: Mutex<Vec<(String, Side, f64)>>,
    reject_brackets: AtomicBool,
}

impl RecordingExecution {
    pub(crate) fn brackets(&self) -> Vec<BracketRequest> {
        self.brackets.lock().clone()
    }

    pub(crate) fn closes(&self) -> Vec<(String, Side, f64)> {
        self.closes.lock().clone()
    }

    pub(crate) fn set_reject_brackets(&self, reject: bool) {
        self.reject_brackets.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionProvider for RecordingExecution {
    async fn place_bracket_order(
        &self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        quantity: f64,
    ) -> Result<BracketOrder> {
        self.brackets.lock().push(BracketRequest {
            symbol: symbol.to_string(),
            side,
            entry_price,
            stop_loss,
            take_profit,
            quantity,
        });
        if self.reject_brackets.load(Ordering::SeqCst) {
            bail!("insufficient margin");
        }
        PaperExecution::new()
            .place_bracket_order(symbol, side, entry_price, stop_loss, take_profit, quantity)
            .await
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reference_price: f64,
    ) -> Result<OrderAck> {
        self.closes.lock().push((symbol.to_string(), side, quantity));
        PaperExecution::new()
            .close_position(symbol, side, quantity, reference_price)
            .await
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct CollectingSink {
    events: Mutex<Vec<BroadcastEvent>>,
}

impl CollectingSink {
    pub(crate) fn events(&self) -> Vec<BroadcastEvent> {
        self.events.lock().clone()
    }
}

impl BroadcastSink for CollectingSink {
    fn publish(&self, event: &BroadcastEvent) {
        self.events.lock().push(event.clone());
    }
}
