// =============================================================================
// Market data sources: live buffers and historical replay
// =============================================================================
//
// The step function never talks to a data source directly. Everything it
// needs is fetched up-front by `fetch_step_data` into an immutable
// `StepData`; if any piece is missing the step is skipped as a whole.
//
// Live and backtest differ only in which `MarketDataSource` they hand to
// `fetch_step_data`.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::market_data::{Bar, BarBuffer, BarKey, SignalBoard, SignalSnapshot, SignalVector};

/// Immutable inputs for one `(symbol, bar)` step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepData {
    pub key: BarKey,
    /// Trailing window, oldest first. The last bar is the current bar.
    pub bars: Vec<Bar>,
    pub signals: SignalVector,
    /// Decision time in epoch milliseconds.
    pub now: i64,
}

impl StepData {
    /// The bar being decided on. `fetch_step_data` guarantees the window is
    /// non-empty.
    pub fn current_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }
}

/// Where bars and signal vectors come from.
pub trait MarketDataSource: Send + Sync {
    /// Up to `len` bars with `timestamp <= end_ts`, oldest first.
    fn bar_window(&self, key: &BarKey, end_ts: i64, len: usize) -> EngineResult<Vec<Bar>>;

    /// Newest signal snapshot with `timestamp <= at`.
    fn signals(&self, key: &BarKey, at: i64) -> EngineResult<SignalSnapshot>;
}

/// Fetch everything a step needs, or fail without side effects.
///
/// `max_signal_lag_ms` bounds how far the signal snapshot may trail the
/// current bar; `0` disables the check.
pub fn fetch_step_data(
    source: &dyn MarketDataSource,
    key: &BarKey,
    now: i64,
    window: usize,
    max_signal_lag_ms: i64,
) -> EngineResult<StepData> {
    let bars = source.bar_window(key, now, window)?;
    let current = bars.last().ok_or_else(|| {
        EngineError::DataUnavailable(format!("no bars for {key} at or before {now}"))
    })?;
    if !current.is_valid() {
        return Err(EngineError::DataUnavailable(format!(
            "current bar for {key} at {} is invalid",
            current.timestamp
        )));
    }

    let snapshot = source.signals(key, now)?;
    if max_signal_lag_ms > 0 && current.timestamp - snapshot.timestamp > max_signal_lag_ms {
        return Err(EngineError::DataUnavailable(format!(
            "signals for {key} are stale: {} ms behind bar {}",
            current.timestamp - snapshot.timestamp,
            current.timestamp
        )));
    }
    snapshot.vector.validate()?;

    Ok(StepData {
        key: key.clone(),
        bars,
        signals: snapshot.vector,
        now,
    })
}

// ---------------------------------------------------------------------------
// Live feed
// ---------------------------------------------------------------------------

/// Live source backed by the in-memory bar buffer and signal board that the
/// ingest task keeps current.
#[derive(Clone)]
pub struct LiveFeed {
    bars: Arc<BarBuffer>,
    signals: Arc<SignalBoard>,
}

impl LiveFeed {
    pub fn new(bars: Arc<BarBuffer>, signals: Arc<SignalBoard>) -> Self {
        Self { bars, signals }
    }
}

impl MarketDataSource for LiveFeed {
    fn bar_window(&self, key: &BarKey, end_ts: i64, len: usize) -> EngineResult<Vec<Bar>> {
        let bars = self.bars.window_ending(key, end_ts, len);
        if bars.is_empty() {
            return Err(EngineError::DataUnavailable(format!("bar buffer empty for {key}")));
        }
        Ok(bars)
    }

    fn signals(&self, key: &BarKey, at: i64) -> EngineResult<SignalSnapshot> {
        self.signals
            .at_or_before(key, at)
            .ok_or_else(|| EngineError::DataUnavailable(format!("no signals published for {key}")))
    }
}

// ---------------------------------------------------------------------------
// Historical feed
// ---------------------------------------------------------------------------

/// Deterministic lookup into a recorded bar sequence and its signal history.
#[derive(Debug, Clone)]
pub struct HistoricalFeed {
    key: BarKey,
    bars: Vec<Bar>,
    signals: BTreeMap<i64, SignalVector>,
}

impl HistoricalFeed {
    /// Bars are sorted by timestamp; duplicate timestamps keep the last bar.
    pub fn new(key: BarKey, mut bars: Vec<Bar>, signals: BTreeMap<i64, SignalVector>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by(|later, earlier| {
            if later.timestamp == earlier.timestamp {
                *earlier = *later;
                true
            } else {
                false
            }
        });
        Self { key, bars, signals }
    }

    pub fn key(&self) -> &BarKey {
        &self.key
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    fn check_key(&self, key: &BarKey) -> EngineResult<()> {
        if key != &self.key {
            return Err(EngineError::DataUnavailable(format!(
                "historical feed holds {} not {key}",
                self.key
            )));
        }
        Ok(())
    }
}

impl MarketDataSource for HistoricalFeed {
    fn bar_window(&self, key: &BarKey, end_ts: i64, len: usize) -> EngineResult<Vec<Bar>> {
        self.check_key(key)?;
        let end = self.bars.partition_point(|b| b.timestamp <= end_ts);
        if end == 0 {
            return Err(EngineError::DataUnavailable(format!(
                "no historical bars for {key} at or before {end_ts}"
            )));
        }
        let start = end.saturating_sub(len);
        Ok(self.bars[start..end].to_vec())
    }

    fn signals(&self, key: &BarKey, at: i64) -> EngineResult<SignalSnapshot> {
        self.check_key(key)?;
        self.signals
            .range(..=at)
            .next_back()
            .map(|(ts, vector)| SignalSnapshot {
                timestamp: *ts,
                vector: vector.clone(),
            })
            .ok_or_else(|| {
                EngineError::DataUnavailable(format!("no historical signals for {key} at {at}"))
            })
    }
}

// ---------------------------------------------------------------------------
// Loaders
// ---------------------------------------------------------------------------

/// Load bars from a CSV file with a `timestamp,open,high,low,close,volume`
/// header.
pub fn load_bars_csv(path: impl AsRef<Path>) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open bar CSV {}", path.display()))?;

    let mut bars = Vec::new();
    for (line, row) in reader.deserialize::<Bar>().enumerate() {
        let bar = row.with_context(|| format!("bad bar row {} in {}", line + 2, path.display()))?;
        bars.push(bar);
    }

    info!(path = %path.display(), bars = bars.len(), "historical bars loaded");
    Ok(bars)
}

/// Load signal snapshots from a JSON-lines file, one `SignalSnapshot` per
/// line. Blank lines are ignored.
pub fn load_signals_jsonl(path: impl AsRef<Path>) -> Result<BTreeMap<i64, SignalVector>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open signal file {}", path.display()))?;

    let mut out = BTreeMap::new();
    for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let snap: SignalSnapshot = serde_json::from_str(&line)
            .with_context(|| format!("bad signal line {} in {}", idx + 1, path.display()))?;
        out.insert(snap.timestamp, snap.vector);
    }

    debug!(path = %path.display(), snapshots = out.len(), "historical signals loaded");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            timestamp: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        }
    }

    fn key() -> BarKey {
        BarKey::new("SOLUSDT", "1h")
    }

    fn feed() -> HistoricalFeed {
        let bars = (0..10).map(|i| bar(i * 10, 100.0 + i as f64)).collect();
        let mut signals = BTreeMap::new();
        signals.insert(0, SignalVector::from_pairs([("m", 0.1)]));
        signals.insert(50, SignalVector::from_pairs([("m", 0.5)]));
        HistoricalFeed::new(key(), bars, signals)
    }

    #[test]
    fn historical_window_ends_at_current_bar() {
        let f = feed();
        let w = f.bar_window(&key(), 45, 3).unwrap();
        assert_eq!(w.iter().map(|b| b.timestamp).collect::<Vec<_>>(), vec![20, 30, 40]);
    }

    #[test]
    fn historical_signals_never_look_ahead() {
        let f = feed();
        assert_eq!(f.signals(&key(), 49).unwrap().timestamp, 0);
        assert_eq!(f.signals(&key(), 50).unwrap().timestamp, 50);
    }

    #[test]
    fn fetch_rejects_stale_signals() {
        let f = feed();
        let err = fetch_step_data(&f, &key(), 40, 5, 30).unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable(_)));
        assert!(fetch_step_data(&f, &key(), 40, 5, 0).is_ok());
    }

    #[test]
    fn fetch_before_history_is_unavailable() {
        let f = feed();
        assert!(fetch_step_data(&f, &key(), -1, 5, 0).is_err());
        assert!(fetch_step_data(&f, &BarKey::new("BTCUSDT", "1h"), 40, 5, 0).is_err());
    }

    #[test]
    fn live_feed_reads_buffers() {
        let bars = Arc::new(BarBuffer::new(50));
        let board = Arc::new(SignalBoard::new());
        let live = LiveFeed::new(bars.clone(), board.clone());
        assert!(fetch_step_data(&live, &key(), 100, 5, 0).is_err());

        bars.push(key(), bar(10, 100.0));
        board.publish(
            key(),
            SignalSnapshot {
                timestamp: 10,
                vector: SignalVector::from_pairs([("m", 0.2)]),
            },
        );
        let data = fetch_step_data(&live, &key(), 100, 5, 0).unwrap();
        assert_eq!(data.current_bar().unwrap().close, 100.0);
    }

    #[test]
    fn csv_and_jsonl_loaders() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("bars.csv");
        std::fs::write(
            &csv_path,
            "timestamp,open,high,low,close,volume\n1000,1,2,0.5,1.5,10\n2000,1.5,2.5,1,2,12\n",
        )
        .unwrap();
        let bars = load_bars_csv(&csv_path).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 2.0);

        let sig_path = dir.path().join("signals.jsonl");
        let mut f = std::fs::File::create(&sig_path).unwrap();
        writeln!(f, r#"{{"timestamp":1000,"vector":{{"names":["m"],"values":[0.4]}}}}"#).unwrap();
        writeln!(f).unwrap();
        let sigs = load_signals_jsonl(&sig_path).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[&1000].value("m"), Some(0.4));
    }
}
