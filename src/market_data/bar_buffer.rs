use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single closed OHLCV bar. `timestamp` is the bar close time in epoch
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    /// A bar is usable when every price is finite and strictly positive and
    /// the high/low envelope is not inverted.
    pub fn is_valid(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite() && *p > 0.0) && self.high >= self.low
    }
}

/// Composite key that identifies a unique bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarKey {
    pub symbol: String,
    pub timeframe: String,
}

impl BarKey {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl std::fmt::Display for BarKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// BarBuffer -- thread-safe ring buffer per (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer that keeps the most recent closed bars per
/// `(symbol, timeframe)` pair, ordered by timestamp.
pub struct BarBuffer {
    buffers: RwLock<HashMap<BarKey, VecDeque<Bar>>>,
    max_bars: usize,
}

impl BarBuffer {
    /// Create a buffer that retains at most `max_bars` bars per key.
    pub fn new(max_bars: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_bars: max_bars.max(1),
        }
    }

    /// Append a closed bar.
    ///
    /// * A bar with the same timestamp as the newest one replaces it (late
    ///   correction from the feed).
    /// * A bar older than the newest one is dropped; the series must stay
    ///   ordered.
    /// * Invalid bars are dropped with a warning.
    pub fn push(&self, key: BarKey, bar: Bar) {
        if !bar.is_valid() {
            warn!(key = %key, ts = bar.timestamp, "dropping invalid bar");
            return;
        }

        let mut map = self.buffers.write();
        let ring = map
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        if let Some(last) = ring.back() {
            if bar.timestamp == last.timestamp {
                ring.pop_back();
            } else if bar.timestamp < last.timestamp {
                debug!(
                    key = %key,
                    ts = bar.timestamp,
                    newest = last.timestamp,
                    "dropping out-of-order bar"
                );
                return;
            }
        }

        ring.push_back(bar);
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
    }

    /// Return up to `count` bars whose timestamp is `<= end_ts`, oldest first.
    pub fn window_ending(&self, key: &BarKey, end_ts: i64, count: usize) -> Vec<Bar> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let eligible: Vec<Bar> = ring
                    .iter()
                    .take_while(|b| b.timestamp <= end_ts)
                    .copied()
                    .collect();
                let start = eligible.len().saturating_sub(count);
                eligible[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Return the most recent `count` bars (oldest first).
    pub fn latest(&self, key: &BarKey, count: usize) -> Vec<Bar> {
        self.window_ending(key, i64::MAX, count)
    }

    /// Timestamp of the newest bar for a key, if any.
    pub fn last_timestamp(&self, key: &BarKey) -> Option<i64> {
        self.buffers
            .read()
            .get(key)
            .and_then(|ring| ring.back().map(|b| b.timestamp))
    }

    pub fn count(&self, key: &BarKey) -> usize {
        self.buffers.read().get(key).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
