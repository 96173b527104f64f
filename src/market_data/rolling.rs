use std::collections::VecDeque;

use super::candle::Candle;

// ---------------------------------------------------------------------------
// RollingBuffer -- bounded window of closed candles for one instance
// ---------------------------------------------------------------------------

/// Ring of the most recent closed candles for a single (symbol, interval).
///
/// Owned by exactly one instance context, so there is no interior locking.
/// Candles must arrive in increasing `open_time` order; a candle at or before
/// the newest held bar is a replay and is ignored (closed bars are never
/// revised).
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    candles: VecDeque<Candle>,
    max_len: usize,
}

impl RollingBuffer {
    /// Create a buffer that retains at most `max_len` closed candles.
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            candles: VecDeque::with_capacity(max_len + 1),
            max_len,
        }
    }

    /// Seed from historical data (oldest first). Keeps only the newest
    /// `max_len` bars.
    pub fn seed(&mut self, history: Vec<Candle>) {
        for candle in history {
            self.push_closed(candle);
        }
    }

    /// Append a closed candle, evicting the oldest when over capacity.
    ///
    /// Returns `false` when the candle was a replay and nothing changed.
    pub fn push_closed(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.back() {
            if candle.open_time <= last.open_time {
                return false;
            }
        }
        self.candles.push_back(candle);
        while self.candles.len() > self.max_len {
            self.candles.pop_front();
        }
        true
    }

    /// Contiguous oldest-first view of the buffered candles.
    pub fn as_slice(&mut self) -> &[Candle] {
        self.candles.make_contiguous()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_len
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
