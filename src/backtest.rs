// =============================================================================
// Backtest Harness: replay history through the live step function
// =============================================================================
//
// Per bar, in timestamp order:
//   - data comes from a `HistoricalFeed` (trailing window ending at the bar)
//   - the bar's own timestamp is passed as `now`
//   - `run_step` is called exactly as the live runner calls it
//   - trade records go to the run's own `trades.jsonl`, never the live log
//   - the equity curve moves only on close events
//
// Artifacts are written into `<out>/<run_id>.partial/` and the directory is
// renamed to `<out>/<run_id>/` only after every file is complete. A failed
// run stays `.partial` and is never mistaken for a finished one.
//
// Independent symbols replay in parallel (rayon); one symbol's failure does
// not affect the others.
// =============================================================================

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span};
use uuid::Uuid;

use crate::decision_envelope::DecisionTrace;
use crate::engine::{run_step, DecisionEngine, StepOutcome, SymbolState};
use crate::ledger::{JsonlSink, LedgerStats, TradeLedger, TradeRecord};
use crate::market_data::{BarKey, HistoricalFeed};
use crate::risk::{RiskBook, RiskSnapshot};
use crate::runtime_config::EngineConfig;
use crate::types::ReplayMode;

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub equity: f64,
    /// Trade whose close produced this point; empty for the starting point.
    pub trade_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub replay_mode: ReplayMode,
    pub config_fingerprint: String,
    pub bars: usize,
    pub steps: u64,
    pub skipped: u64,
    pub blocked: u64,
    pub opens: u64,
    pub closes: u64,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub stats: LedgerStats,
    /// Trade still open when history ran out.
    pub open_at_end: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub run_dir: PathBuf,
    pub manifest: RunManifest,
    pub trades: Vec<TradeRecord>,
    pub equity: Vec<EquityPoint>,
    pub decisions: Vec<DecisionTrace>,
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct BacktestHarness {
    config: Arc<EngineConfig>,
    mode: ReplayMode,
    out_dir: PathBuf,
    base_risk: RiskSnapshot,
}

impl BacktestHarness {
    pub fn new(config: Arc<EngineConfig>, mode: ReplayMode, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            mode,
            out_dir: out_dir.into(),
            base_risk: RiskSnapshot::default(),
        }
    }

    /// Edge tables and blind spots the replay starts from.
    pub fn with_base_risk(mut self, base_risk: RiskSnapshot) -> Self {
        self.base_risk = base_risk;
        self
    }

    /// Replay every symbol in parallel. Each result stands alone.
    pub fn run_many(&self, feeds: &[HistoricalFeed]) -> Vec<(BarKey, Result<BacktestReport>)> {
        feeds
            .par_iter()
            .map(|feed| (feed.key().clone(), self.run(feed)))
            .collect()
    }

    pub fn run(&self, feed: &HistoricalFeed) -> Result<BacktestReport> {
        let key = feed.key().clone();
        let short_id = Uuid::new_v4().simple().to_string();
        let run_id = format!(
            "{}-{}-{}",
            key.symbol.to_lowercase(),
            key.timeframe,
            &short_id[..8]
        );
        let span = info_span!("backtest", run_id = %run_id);
        let _enter = span.enter();

        std::fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("failed to create {}", self.out_dir.display()))?;
        let partial = self.out_dir.join(format!("{run_id}.partial"));
        std::fs::create_dir_all(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;

        match self.replay(feed, &run_id, &partial) {
            Ok(mut report) => {
                let final_dir = self.out_dir.join(&run_id);
                std::fs::rename(&partial, &final_dir).with_context(|| {
                    format!("failed to promote {} to {}", partial.display(), final_dir.display())
                })?;
                report.run_dir = final_dir;
                info!(
                    symbol = %key.symbol,
                    closes = report.manifest.closes,
                    final_equity = report.manifest.final_equity,
                    pf = report.manifest.stats.profit_factor(),
                    "backtest complete"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, dir = %partial.display(), "backtest aborted; run left incomplete");
                Err(e)
            }
        }
    }

    fn replay(&self, feed: &HistoricalFeed, run_id: &str, dir: &Path) -> Result<BacktestReport> {
        let started_at = Utc::now();
        let key = feed.key().clone();
        let cfg = &self.config;

        let engine = DecisionEngine::new(cfg.clone(), self.mode)?;
        let sink = JsonlSink::open(dir.join("trades.jsonl"))?;
        let ledger = TradeLedger::new(key.symbol.clone(), Box::new(sink), cfg.ledger.history_limit);
        let mut state = SymbolState::new(key.clone(), ledger);
        let book = RiskBook::new(self.base_risk.clone());

        let decisions_path = dir.join("decisions.jsonl");
        let mut decisions_out = BufWriter::new(
            File::create(&decisions_path)
                .with_context(|| format!("failed to create {}", decisions_path.display()))?,
        );

        let mut equity = cfg.initial_equity;
        let mut curve = vec![EquityPoint {
            timestamp: feed.bars().first().map(|b| b.timestamp).unwrap_or(0),
            equity,
            trade_id: None,
        }];
        let mut trades = Vec::new();
        let mut decisions = Vec::new();
        let (mut steps, mut skipped, mut blocked, mut opens, mut closes) = (0u64, 0u64, 0u64, 0u64, 0u64);

        for bar in feed.bars() {
            let now = bar.timestamp;
            let outcome = run_step(&engine, &mut state, feed, now, &book);
            steps += 1;
            match &outcome {
                StepOutcome::Skip { .. } => skipped += 1,
                StepOutcome::Blocked { .. } => blocked += 1,
                StepOutcome::Ok(_) => {}
            }

            if let Some(trace) = DecisionTrace::from_outcome(&key, now, &outcome) {
                serde_json::to_writer(&mut decisions_out, &trace)?;
                decisions_out.write_all(b"\n")?;
                decisions.push(trace);
            }
            if let Some(closed) = outcome.closed() {
                closes += 1;
                equity += closed.notional * closed.pct.unwrap_or(0.0) / 100.0;
                curve.push(EquityPoint {
                    timestamp: closed.bar_timestamp,
                    equity,
                    trade_id: Some(closed.trade_id.clone()),
                });
                trades.push(closed.clone());
            }
            if let Some(opened) = outcome.opened() {
                opens += 1;
                trades.push(opened.clone());
            }
        }

        decisions_out.flush()?;
        state.ledger.flush()?;
        if state.ledger.sink_failures() > 0 {
            bail!(
                "{} trade records failed to persist for {run_id}",
                state.ledger.sink_failures()
            );
        }

        write_equity_csv(&dir.join("equity.csv"), &curve)?;

        let manifest = RunManifest {
            run_id: run_id.to_string(),
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
            replay_mode: self.mode,
            config_fingerprint: cfg.fingerprint(),
            bars: feed.bars().len(),
            steps,
            skipped,
            blocked,
            opens,
            closes,
            initial_equity: cfg.initial_equity,
            final_equity: equity,
            stats: state.ledger.stats().clone(),
            open_at_end: state.ledger.open_trade().map(str::to_string),
            started_at,
            finished_at: Utc::now(),
            complete: true,
        };
        write_manifest(&dir.join("manifest.json"), &manifest)?;

        Ok(BacktestReport {
            run_dir: dir.to_path_buf(),
            manifest,
            trades,
            equity: curve,
            decisions,
        })
    }
}

fn write_equity_csv(path: &Path, curve: &[EquityPoint]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create equity CSV {}", path.display()))?;
    for point in curve {
        writer.serialize(point)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest).context("failed to serialise run manifest")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write manifest to {}", path.display()))
}

/// Load a finished run's manifest. Refuses runs that never completed.
pub fn load_manifest(run_dir: impl AsRef<Path>) -> Result<RunManifest> {
    let path = run_dir.as_ref().join("manifest.json");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let manifest: RunManifest =
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    if !manifest.complete {
        bail!("run {} is incomplete", manifest.run_id);
    }
    Ok(manifest)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TradeEvent;
    use crate::market_data::{Bar, SignalVector};
    use crate::runtime_config::default_bucket_spec;
    use std::collections::BTreeMap;

    const BAR_MS: i64 = 300_000;

    fn uniform(value: f64) -> SignalVector {
        let mut names: Vec<String> = default_bucket_spec()
            .values()
            .flatten()
            .map(|e| e.signal.clone())
            .collect();
        names.sort();
        names.dedup();
        SignalVector::from_pairs(names.into_iter().map(|n| (n, value)))
    }

    fn feed(symbol: &str, closes: &[f64], signal: impl Fn(usize) -> f64) -> HistoricalFeed {
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: (i as i64 + 1) * BAR_MS,
                open: c,
                high: c + 0.2,
                low: c - 0.2,
                close: c,
                volume: 1.0,
            })
            .collect();
        let signals: BTreeMap<i64, SignalVector> = bars
            .iter()
            .enumerate()
            .map(|(i, b)| (b.timestamp, uniform(signal(i))))
            .collect();
        HistoricalFeed::new(BarKey::new(symbol, "5m"), bars, signals)
    }

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + 0.2 * i as f64).collect()
    }

    fn harness(dir: &Path, mode: ReplayMode) -> BacktestHarness {
        BacktestHarness::new(Arc::new(EngineConfig::default()), mode, dir)
    }

    #[test]
    fn completed_run_is_promoted_with_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let f = feed("BTCUSDT", &rising(60), |i| if i == 31 { 0.9 } else { 0.6 });
        let report = harness(tmp.path(), ReplayMode::Standard).run(&f).unwrap();

        assert!(report.run_dir.is_dir());
        assert!(!report.run_dir.to_string_lossy().ends_with(".partial"));
        for file in ["manifest.json", "trades.jsonl", "equity.csv", "decisions.jsonl"] {
            assert!(report.run_dir.join(file).is_file(), "{file} missing");
        }

        let manifest = load_manifest(&report.run_dir).unwrap();
        assert!(manifest.complete);
        assert_eq!(manifest.bars, 60);
        assert!(manifest.closes >= 1);
        assert_eq!(manifest.config_fingerprint, EngineConfig::default().fingerprint());

        // Opens and closes alternate; equity moves only at closes.
        for pair in report.trades.chunks(2) {
            assert_eq!(pair[0].event, TradeEvent::Open);
            if let Some(close) = pair.get(1) {
                assert_eq!(close.event, TradeEvent::Close);
                assert_eq!(close.trade_id, pair[0].trade_id);
            }
        }
        assert_eq!(report.equity.len() as u64, manifest.closes + 1);

        let logged = std::fs::read_to_string(report.run_dir.join("trades.jsonl")).unwrap();
        assert_eq!(logged.lines().count(), report.trades.len());
    }

    #[test]
    fn analytical_mode_trades_where_standard_stays_flat() {
        let tmp = tempfile::tempdir().unwrap();
        let chop: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 100.0 } else { 100.4 }).collect();
        let f = feed("ETHUSDT", &chop, |_| 0.7);

        let standard = harness(tmp.path(), ReplayMode::Standard).run(&f).unwrap();
        assert_eq!(standard.manifest.opens, 0);

        let analytical = harness(tmp.path(), ReplayMode::Analytical).run(&f).unwrap();
        assert!(analytical.manifest.opens > 0);
        assert_ne!(standard.manifest.run_id, analytical.manifest.run_id);
    }

    #[test]
    fn base_risk_file_gates_every_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let risk_path = tmp.path().join("risk.json");
        std::fs::write(&risk_path, r#"{ "profit_factor": 0.1 }"#).unwrap();
        let base = crate::risk::load_risk_snapshot(&risk_path).unwrap();

        let f = feed("BTCUSDT", &rising(60), |i| if i == 31 { 0.9 } else { 0.6 });
        let open = harness(tmp.path(), ReplayMode::Standard).run(&f).unwrap();
        assert!(open.manifest.opens >= 1);

        let gated = harness(tmp.path(), ReplayMode::Standard)
            .with_base_risk(base)
            .run(&f)
            .unwrap();
        assert_eq!(gated.manifest.opens, 0);
        assert!(gated
            .decisions
            .iter()
            .any(|t| t.reason.as_deref().is_some_and(|r| r.contains("profit factor"))));
    }

    #[test]
    fn failed_run_is_not_promoted() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let f = feed("BTCUSDT", &rising(10), |_| 0.6);
        assert!(harness(&blocker.join("runs"), ReplayMode::Standard).run(&f).is_err());
    }

    #[test]
    fn incomplete_manifest_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let f = feed("BTCUSDT", &rising(30), |_| 0.6);
        let report = harness(tmp.path(), ReplayMode::Standard).run(&f).unwrap();
        let mut m = report.manifest.clone();
        m.complete = false;
        write_manifest(&report.run_dir.join("manifest.json"), &m).unwrap();
        assert!(load_manifest(&report.run_dir).is_err());
    }

    #[test]
    fn run_many_isolates_symbols() {
        let tmp = tempfile::tempdir().unwrap();
        let feeds = vec![
            feed("BTCUSDT", &rising(40), |_| 0.6),
            feed("ETHUSDT", &rising(40), |_| 0.0),
            HistoricalFeed::new(BarKey::new("SOLUSDT", "5m"), Vec::new(), BTreeMap::new()),
        ];
        let results = harness(tmp.path(), ReplayMode::Standard).run_many(&feeds);
        assert_eq!(results.len(), 3);
        for (key, result) in &results {
            let report = result.as_ref().unwrap();
            assert_eq!(report.manifest.symbol, key.symbol);
        }
        let sol = &results.iter().find(|(k, _)| k.symbol == "SOLUSDT").unwrap().1;
        assert_eq!(sol.as_ref().unwrap().manifest.steps, 0);
        let eth = &results.iter().find(|(k, _)| k.symbol == "ETHUSDT").unwrap().1;
        assert_eq!(eth.as_ref().unwrap().manifest.opens, 0);
    }
}
