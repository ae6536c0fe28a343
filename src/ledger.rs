// =============================================================================
// Trade Ledger: append-only open/close records and realized statistics
// =============================================================================
//
// Every open and close is appended to a `TradeSink` (JSON lines on disk, or
// memory in tests) and mirrored into a bounded rolling history that the entry
// guardrails read. The ledger enforces that opens and closes alternate per
// symbol and that each close references the open before it.
//
// Statistics are price-based percentages:
//   win / loss      material closes with pct > 0 / pct < 0
//   profit factor   Σ wins / |Σ losses|, scratches excluded
//   drawdown        peak-to-trough of the compounded index Π(1 + pct/100)
// =============================================================================

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{EngineError, EngineResult};
use crate::exit::ExitReason;
use crate::regime::Regime;
use crate::types::Direction;

/// PF reported when there are wins but no losses.
pub const PROFIT_FACTOR_CAP: f64 = 99.0;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeEvent {
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// `<trade_id>:open` or `<trade_id>:close`.
    pub record_id: String,
    pub trade_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub event: TradeEvent,
    pub direction: Direction,
    /// Fill price: the close of the bar that triggered the event.
    pub price: f64,
    /// Timestamp of that bar (epoch ms).
    pub bar_timestamp: i64,
    pub regime: Regime,
    pub confidence: f64,
    pub notional: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_scratch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bars_held: Option<u32>,
    /// Decision time (epoch ms). Wall clock live, bar time in replay.
    pub recorded_at: i64,
}

impl TradeRecord {
    pub fn is_close(&self) -> bool {
        self.event == TradeEvent::Close
    }

    /// Closed at a loss that was not a scratch.
    pub fn is_material_loss(&self) -> bool {
        self.is_close() && !self.is_scratch.unwrap_or(false) && self.pct.unwrap_or(0.0) < 0.0
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Append-only destination for trade records.
pub trait TradeSink: Send {
    fn append(&mut self, record: &TradeRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One JSON object per line, appended to a file.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open trade log {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TradeSink for JsonlSink {
    fn append(&mut self, record: &TradeRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record).context("failed to encode trade record")?;
        self.writer.write_all(b"\n")?;
        // Each record is durable before the step returns.
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(Into::into)
    }
}

/// In-memory sink; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TradeRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TradeRecord> {
        self.records.lock().clone()
    }
}

impl TradeSink for MemorySink {
    fn append(&mut self, record: &TradeRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

impl TradeSink for Box<dyn TradeSink> {
    fn append(&mut self, record: &TradeRecord) -> Result<()> {
        (**self).append(record)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Lets several ledgers write to one file.
impl<T: TradeSink> TradeSink for Arc<Mutex<T>> {
    fn append(&mut self, record: &TradeRecord) -> Result<()> {
        self.lock().append(record)
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().flush()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub scratches: u32,
    pub gross_profit_pct: f64,
    pub gross_loss_pct: f64,
    pub cumulative_pct: f64,
    /// Compounded index starting at 1.0.
    pub equity_index: f64,
    pub peak_index: f64,
    /// Current drawdown from peak, as a fraction.
    pub drawdown: f64,
    pub max_drawdown: f64,
}

impl Default for LedgerStats {
    fn default() -> Self {
        Self {
            trades: 0,
            wins: 0,
            losses: 0,
            scratches: 0,
            gross_profit_pct: 0.0,
            gross_loss_pct: 0.0,
            cumulative_pct: 0.0,
            equity_index: 1.0,
            peak_index: 1.0,
            drawdown: 0.0,
            max_drawdown: 0.0,
        }
    }
}

impl LedgerStats {
    pub fn record_close(&mut self, pct: f64, is_scratch: bool) {
        let pct = if pct.is_finite() { pct } else { 0.0 };
        self.trades += 1;
        if is_scratch {
            self.scratches += 1;
        } else if pct > 0.0 {
            self.wins += 1;
            self.gross_profit_pct += pct;
        } else if pct < 0.0 {
            self.losses += 1;
            self.gross_loss_pct += pct.abs();
        }
        self.cumulative_pct += pct;

        self.equity_index *= (1.0 + pct / 100.0).max(0.0);
        self.peak_index = self.peak_index.max(self.equity_index);
        self.drawdown = if self.peak_index > 0.0 {
            1.0 - self.equity_index / self.peak_index
        } else {
            1.0
        };
        self.max_drawdown = self.max_drawdown.max(self.drawdown);
    }

    /// Wins plus losses; scratches and flat closes excluded.
    pub fn material_trades(&self) -> u32 {
        self.wins + self.losses
    }

    /// Neutral 1.0 before the first material close, capped at
    /// `PROFIT_FACTOR_CAP`.
    pub fn profit_factor(&self) -> f64 {
        if self.material_trades() == 0 {
            return 1.0;
        }
        if self.gross_loss_pct <= 0.0 {
            return PROFIT_FACTOR_CAP;
        }
        (self.gross_profit_pct / self.gross_loss_pct).min(PROFIT_FACTOR_CAP)
    }

    pub fn win_rate(&self) -> f64 {
        match self.material_trades() {
            0 => 0.0,
            n => self.wins as f64 / n as f64,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct TradeLedger {
    symbol: String,
    sink: Box<dyn TradeSink>,
    history: VecDeque<TradeRecord>,
    history_limit: usize,
    open_trade: Option<String>,
    last_open_at: Option<i64>,
    stats: LedgerStats,
    sink_failures: u64,
}

impl TradeLedger {
    pub fn new(symbol: impl Into<String>, sink: Box<dyn TradeSink>, history_limit: usize) -> Self {
        Self {
            symbol: symbol.into(),
            sink,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            open_trade: None,
            last_open_at: None,
            stats: LedgerStats::default(),
            sink_failures: 0,
        }
    }

    pub fn in_memory(symbol: impl Into<String>, history_limit: usize) -> (Self, MemorySink) {
        let sink = MemorySink::new();
        (Self::new(symbol, Box::new(sink.clone()), history_limit), sink)
    }

    pub fn record_open(&mut self, record: TradeRecord) -> EngineResult<()> {
        self.check_symbol(&record)?;
        if record.event != TradeEvent::Open {
            return Err(EngineError::InvariantViolation(format!(
                "{} passed to record_open",
                record.record_id
            )));
        }
        if let Some(open) = &self.open_trade {
            error!(symbol = %self.symbol, open = %open, attempted = %record.trade_id, "INVARIANT: second open without close");
            return Err(EngineError::InvariantViolation(format!(
                "{} still open, cannot open {}",
                open, record.trade_id
            )));
        }
        self.open_trade = Some(record.trade_id.clone());
        self.last_open_at = Some(record.recorded_at);
        self.append(record);
        Ok(())
    }

    pub fn record_close(&mut self, record: TradeRecord) -> EngineResult<()> {
        self.check_symbol(&record)?;
        if record.event != TradeEvent::Close {
            return Err(EngineError::InvariantViolation(format!(
                "{} passed to record_close",
                record.record_id
            )));
        }
        match &self.open_trade {
            Some(open) if *open == record.trade_id => {}
            other => {
                error!(symbol = %self.symbol, open = ?other, attempted = %record.trade_id, "INVARIANT: close does not match open trade");
                return Err(EngineError::InvariantViolation(format!(
                    "close {} does not reference the open trade {:?}",
                    record.trade_id, other
                )));
            }
        }
        self.open_trade = None;
        self.stats
            .record_close(record.pct.unwrap_or(0.0), record.is_scratch.unwrap_or(false));
        info!(
            trade_id = %record.trade_id,
            reason = ?record.exit_reason,
            pct = record.pct.unwrap_or(0.0),
            scratch = record.is_scratch.unwrap_or(false),
            pf = self.stats.profit_factor(),
            "trade closed"
        );
        self.append(record);
        Ok(())
    }

    fn check_symbol(&self, record: &TradeRecord) -> EngineResult<()> {
        if record.symbol != self.symbol {
            return Err(EngineError::InvariantViolation(format!(
                "{} record routed to {} ledger",
                record.symbol, self.symbol
            )));
        }
        Ok(())
    }

    fn append(&mut self, record: TradeRecord) {
        // A failing sink never rolls back in-memory state; the failure is
        // counted and logged loudly.
        if let Err(e) = self.sink.append(&record) {
            self.sink_failures += 1;
            error!(error = %e, record = %record.record_id, "failed to append trade record");
        }
        self.history.push_back(record);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn open_trade(&self) -> Option<&str> {
        self.open_trade.as_deref()
    }

    /// `recorded_at` of the most recent open, retained past history trimming.
    pub fn last_open_at(&self) -> Option<i64> {
        self.last_open_at
    }

    /// Material losing closes recorded at or after `since`.
    pub fn material_losses_since(&self, since: i64) -> u32 {
        self.history
            .iter()
            .filter(|r| r.recorded_at >= since && r.is_material_loss())
            .count() as u32
    }

    pub fn recent(&self, n: usize) -> Vec<TradeRecord> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()
    }
}
