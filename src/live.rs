// =============================================================================
// Live Runner: steps every configured symbol against the live feed
// =============================================================================
//
// The runner owns one `SymbolState` per symbol, one shared risk book, and the
// live trade log. Each `tick` walks the symbols in order and calls the same
// `run_step` the replay harness uses. A symbol that skips or blocks never
// stops the others.
//
// Config hot reload: when the handle's version moves, the engine is rebuilt
// between ticks. A rebuild that fails keeps the previous engine.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::decision_envelope::{DecisionLog, DecisionTrace};
use crate::engine::{run_step, DecisionEngine, StepOutcome, SymbolState};
use crate::ledger::{JsonlSink, TradeLedger, TradeSink};
use crate::market_data::{BarKey, LiveFeed};
use crate::risk::{RiskBook, RiskSnapshot};
use crate::runtime_config::ConfigHandle;
use crate::types::ReplayMode;

pub struct LiveRunner {
    config: Arc<ConfigHandle>,
    config_version: u64,
    engine: DecisionEngine,
    feed: LiveFeed,
    states: BTreeMap<String, SymbolState>,
    /// One live log shared by every symbol's ledger.
    sink: Arc<Mutex<Box<dyn TradeSink>>>,
    risk: RiskBook,
    decisions: Arc<DecisionLog>,
}

impl LiveRunner {
    /// Build a runner writing its trade log to `trade_log`.
    pub fn new(
        config: Arc<ConfigHandle>,
        feed: LiveFeed,
        trade_log: impl AsRef<Path>,
        base_risk: RiskSnapshot,
    ) -> Result<Self> {
        let sink = JsonlSink::open(trade_log)?;
        Self::with_sink(config, feed, Box::new(sink), base_risk)
    }

    pub fn with_sink(
        config: Arc<ConfigHandle>,
        feed: LiveFeed,
        sink: Box<dyn TradeSink>,
        base_risk: RiskSnapshot,
    ) -> Result<Self> {
        let snapshot = config.snapshot();
        let config_version = config.version();
        // Live never widens the allow-list.
        let engine = DecisionEngine::new(snapshot.clone(), ReplayMode::Standard)?;
        let decisions = Arc::new(DecisionLog::new(snapshot.decision_log_capacity));
        let sink = Arc::new(Mutex::new(sink));

        let mut runner = Self {
            config,
            config_version,
            engine,
            feed,
            states: BTreeMap::new(),
            sink,
            risk: RiskBook::new(base_risk),
            decisions,
        };
        runner.sync_symbols();
        Ok(runner)
    }

    pub fn decisions(&self) -> &Arc<DecisionLog> {
        &self.decisions
    }

    pub fn risk(&self) -> &RiskBook {
        &self.risk
    }

    pub fn state(&self, symbol: &str) -> Option<&SymbolState> {
        self.states.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// Step every symbol once at `now` (epoch ms).
    pub fn tick(&mut self, now: i64) -> Vec<(String, StepOutcome)> {
        self.maybe_rebuild();

        let mut outcomes = Vec::with_capacity(self.states.len());
        for (symbol, state) in self.states.iter_mut() {
            let outcome = run_step(&self.engine, state, &self.feed, now, &self.risk);
            if let Some(trace) = DecisionTrace::from_outcome(&state.key, now, &outcome) {
                self.decisions.push(trace);
            }
            outcomes.push((symbol.clone(), outcome));
        }
        outcomes
    }

    fn maybe_rebuild(&mut self) {
        let version = self.config.version();
        if version == self.config_version {
            return;
        }
        let snapshot = self.config.snapshot();
        match DecisionEngine::new(snapshot, ReplayMode::Standard) {
            Ok(engine) => {
                self.engine = engine;
                self.config_version = version;
                self.sync_symbols();
                info!(version, "live engine rebuilt from new config");
            }
            Err(e) => {
                // Retry on the next version bump only.
                self.config_version = version;
                error!(error = %e, version, "config rejected; keeping previous engine");
            }
        }
    }

    /// Add states for newly configured symbols. Removed symbols keep their
    /// state so an open position is never dropped silently.
    fn sync_symbols(&mut self) {
        let cfg = self.engine.config().clone();
        for symbol in &cfg.symbols {
            let symbol = symbol.trim().to_uppercase();
            if symbol.is_empty() || self.states.contains_key(&symbol) {
                continue;
            }
            let ledger = TradeLedger::new(
                symbol.clone(),
                Box::new(self.sink.clone()),
                cfg.ledger.history_limit,
            );
            let key = BarKey::new(symbol.clone(), cfg.timeframe.clone());
            info!(symbol = %symbol, timeframe = %cfg.timeframe, "live symbol registered");
            self.states.insert(symbol, SymbolState::new(key, ledger));
        }
    }
}
