// =============================================================================
// Strategy Instance - one live (symbol, strategy, timeframe) execution context
// =============================================================================
//
// Runs on its own OS thread inside a current-thread runtime. Everything in
// here is sequential: stream consumption, buffer mutation, signal evaluation
// and order placement happen one step at a time, so the buffer and trade book
// are plain owned values.
//
//   seed buffer -> subscribe -> per message:
//       publish candle event
//       closed bar: persist -> buffer -> exit check -> annotate -> entry
//
// Cancellation is observed at every wait (seed fetch, subscribe, next
// message, reconnect delay). An order request already in flight is allowed to
// finish so its outcome is known.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use super::registry::{InstanceHandle, InstanceStats};
use crate::backtest::TradeBook;
use crate::broadcast::{BroadcastEvent, BroadcastSink, CandleEvent, TradeEvent};
use crate::candle_cache::CandleCache;
use crate::execution::ExecutionProvider;
use crate::market_data::{Candle, LiveCandle, RollingBuffer, DAY_MS};
use crate::provider::MarketDataProvider;
use crate::runtime_config::{OrchestratorSettings, StrategyParams};
use crate::signals::{annotate_last, required_history};
use crate::types::{now_ms, ExitReason, InstanceKey, InstanceState};

/// Shared collaborators handed to every instance.
#[derive(Clone)]
pub struct InstanceDeps {
    pub cache: Arc<CandleCache>,
    pub provider: Arc<dyn MarketDataProvider>,
    pub execution: Arc<dyn ExecutionProvider>,
    pub sink: Arc<dyn BroadcastSink>,
    pub settings: OrchestratorSettings,
}

/// Build the runtime on the current (dedicated) thread and run the instance
/// to completion.
pub fn run_on_thread(key: InstanceKey, params: StrategyParams, deps: InstanceDeps, handle: InstanceHandle) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(instance = %key, error = %e, "failed to build instance runtime");
            handle.set_state(InstanceState::Stopped);
            return;
        }
    };
    runtime.block_on(Instance::new(key, params, deps, handle).run());
}

struct Instance {
    key: InstanceKey,
    params: StrategyParams,
    deps: InstanceDeps,
    handle: InstanceHandle,
    buffer: RollingBuffer,
    book: TradeBook,
    /// Monotonic index of closed bars seen, for the entry cooldown.
    bar_index: usize,
}

impl Instance {
    fn new(key: InstanceKey, params: StrategyParams, deps: InstanceDeps, handle: InstanceHandle) -> Self {
        let settings = &deps.settings;
        let capacity = settings
            .min_required_candles
            .max(required_history(&params, &key.timeframe))
            * settings.buffer_retention_multiple.max(1);
        Self {
            buffer: RollingBuffer::new(capacity),
            book: TradeBook::new(params.initial_balance),
            bar_index: 0,
            key,
            params,
            deps,
            handle,
        }
    }

    async fn run(mut self) {
        let cancel = self.handle.cancel.clone();

        tokio::select! {
            _ = cancel.cancelled() => {
                self.unwind().await;
                return;
            }
            _ = self.seed() => {}
        }
        self.handle.mark_running();
        info!(
            instance = %self.key,
            buffered = self.buffer.len(),
            capacity = self.buffer.capacity(),
            "instance running"
        );

        let reconnect_delay = Duration::from_secs(self.deps.settings.reconnect_delay_secs);
        'outer: loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                s = self.deps.provider.subscribe_live(&self.key.symbol, &self.key.timeframe) => s,
            };

            match subscribed {
                Ok(mut stream) => loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        msg = stream.next() => msg,
                    };
                    match next {
                        Some(Ok(live)) => self.on_message(live).await,
                        Some(Err(e)) => {
                            warn!(instance = %self.key, error = %e, "live stream error, resubscribing");
                            break;
                        }
                        None => {
                            warn!(instance = %self.key, "live stream ended, resubscribing");
                            break;
                        }
                    }
                },
                Err(e) => {
                    warn!(instance = %self.key, error = %e, "subscribe failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }

        // Every stream handle is out of scope here: the subscription is closed.
        self.unwind().await;
    }

    /// Load recent history into the buffer through the cache.
    async fn seed(&mut self) {
        let start = now_ms() - i64::from(self.deps.settings.seed_lookback_days) * DAY_MS;
        let fetched = self
            .deps
            .cache
            .fetch(&self.key.symbol, &self.key.timeframe, start, None)
            .await;
        if fetched.data_unavailable() {
            warn!(instance = %self.key, source = %fetched.source, "no seed history, starting empty");
        }
        self.buffer.seed(fetched.candles);
        self.bar_index = self.buffer.len();
        self.report_stats();
        debug!(instance = %self.key, seeded = self.buffer.len(), "buffer seeded");
    }

    fn report_stats(&self) {
        self.handle.record_stats(InstanceStats {
            buffered_bars: self.buffer.len(),
            last_bar_time: self.buffer.last().map(|c| c.open_time),
            capital: self.book.capital(),
            open_position: self.book.position().map(|p| p.side),
            closed_trades: self.book.trades().len(),
        });
    }

    async fn on_message(&mut self, live: LiveCandle) {
        self.deps
            .sink
            .publish(&BroadcastEvent::Candle(CandleEvent::new(&self.key, &live)));
        if !live.is_closed {
            return;
        }

        self.on_closed_bar(live.to_candle()).await;
        self.report_stats();
    }

    async fn on_closed_bar(&mut self, candle: Candle) {
        if let Err(e) = self
            .deps
            .cache
            .store()
            .upsert_ignore_duplicates(std::slice::from_ref(&candle))
        {
            warn!(instance = %self.key, error = %e, "failed to persist closed bar");
        }
        if !self.buffer.push_closed(candle.clone()) {
            debug!(instance = %self.key, open_time = candle.open_time, "replayed bar ignored");
            return;
        }
        self.bar_index += 1;

        if let Some(trade) = self.book.check_exit(&candle) {
            info!(
                instance = %self.key,
                reason = %trade.exit_reason,
                pnl = trade.pnl,
                capital = trade.capital_after_trade,
                "position closed"
            );
            let event = TradeEvent::position_closed(&self.key, trade);
            self.deps.sink.publish(&BroadcastEvent::TradeEvent(event));
        }

        let Some(bar) = annotate_last(self.buffer.as_slice(), &self.params) else {
            return;
        };
        let Some(plan) = self.book.plan_entry(self.bar_index, &bar, &self.params) else {
            return;
        };

        match self
            .deps
            .execution
            .place_bracket_order(
                &self.key.symbol,
                plan.side,
                plan.entry_price,
                plan.stop_loss,
                plan.take_profit,
                plan.size,
            )
            .await
        {
            Ok(bracket) => {
                self.book.open(self.bar_index, candle.open_time, plan);
                info!(
                    instance = %self.key,
                    side = %plan.side,
                    entry = plan.entry_price,
                    sl = plan.stop_loss,
                    tp = plan.take_profit,
                    size = plan.size,
                    "position opened"
                );
                for leg in bracket.legs() {
                    self.deps
                        .sink
                        .publish(&BroadcastEvent::TradeEvent(TradeEvent::order(&self.key, leg)));
                }
            }
            Err(e) => {
                warn!(instance = %self.key, side = %plan.side, error = %e, "bracket order failed, no position opened");
            }
        }
    }

    /// Flatten any open position. Best-effort: a failure is logged and the
    /// instance still stops.
    async fn unwind(&mut self) {
        if let Some(position) = self.book.position().cloned() {
            let reference = self.buffer.last().map_or(position.entry_price, |c| c.close);
            match self
                .deps
                .execution
                .close_position(&self.key.symbol, position.side, position.size, reference)
                .await
            {
                Ok(ack) => {
                    self.deps
                        .sink
                        .publish(&BroadcastEvent::TradeEvent(TradeEvent::order(&self.key, &ack)));
                    if let Some(trade) = self.book.force_close(ack.price, ack.timestamp, ExitReason::InstanceStopped) {
                        let event = TradeEvent::position_closed(&self.key, trade);
                        self.deps.sink.publish(&BroadcastEvent::TradeEvent(event));
                    }
                    self.report_stats();
                }
                Err(e) => {
                    warn!(instance = %self.key, error = %e, "failed to close position on stop");
                }
            }
        }
        info!(
            instance = %self.key,
            trades = self.book.trades().len(),
            capital = self.book.capital(),
            "instance stopped"
        );
    }
}
