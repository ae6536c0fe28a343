// =============================================================================
// Decision Engine: the single step function shared by live and replay
// =============================================================================
//
// Pipeline per (symbol, bar):
//   1. Reject a repeated or out-of-order bar (skip, no mutation)
//   2. Classify the regime from the trailing bar window
//   3. Aggregate the signal vector under that regime
//   4. OPEN  -> advance bars_open, run the exit state machine, settle any exit
//      (a reverse exit may re-enter through the entry gate)
//      FLAT  -> run the entry gate, open at the bar close on pass
//   5. Record every open/close in the symbol's ledger
//
// All inputs arrive as an immutable `StepData` and a `RiskSnapshot` fetched
// before the step starts. Nothing here reads the environment, the clock, or
// whether the caller is live or a replay.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::decision_envelope::OutcomeKind;
use crate::entry_gate::{EntryGate, EntryRequest, EntryVerdict};
use crate::error::{EngineError, EngineResult};
use crate::exit::{self, ExitReason, ExitSignal};
use crate::ledger::{TradeEvent, TradeLedger, TradeRecord};
use crate::market_data::{fetch_step_data, Bar, BarKey, MarketDataSource, StepData};
use crate::position_engine::{Position, PositionSlot};
use crate::regime::{classify, RegimeResult};
use crate::risk::{RiskBook, RiskSnapshot};
use crate::runtime_config::EngineConfig;
use crate::signals::{Aggregator, Decision};
use crate::types::ReplayMode;

// =============================================================================
// Outcome
// =============================================================================

/// What one step decided and did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub bar_timestamp: i64,
    pub regime: RegimeResult,
    pub decision: Decision,
    pub opened: Option<TradeRecord>,
    pub closed: Option<TradeRecord>,
    /// Why an entry was declined, when one was considered.
    pub note: Option<String>,
    /// Finite raw readings that came with the signal vector. Audit only.
    pub raw: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step ran; it may or may not have traded.
    Ok(StepReport),
    /// Inputs were unusable; nothing was decided or mutated.
    Skip { reason: String },
    /// A guardrail, the sizer, or an invariant check refused the action.
    Blocked { reason: String, report: StepReport },
}

impl StepOutcome {
    pub fn report(&self) -> Option<&StepReport> {
        match self {
            Self::Ok(report) | Self::Blocked { report, .. } => Some(report),
            Self::Skip { .. } => None,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Ok(_) => OutcomeKind::Ok,
            Self::Skip { .. } => OutcomeKind::Skip,
            Self::Blocked { .. } => OutcomeKind::Blocked,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ok(report) => report.note.as_deref(),
            Self::Skip { reason } | Self::Blocked { reason, .. } => Some(reason),
        }
    }

    pub fn opened(&self) -> Option<&TradeRecord> {
        self.report().and_then(|r| r.opened.as_ref())
    }

    pub fn closed(&self) -> Option<&TradeRecord> {
        self.report().and_then(|r| r.closed.as_ref())
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Per-symbol state
// =============================================================================

/// Everything a symbol owns between steps. Symbols never share one.
pub struct SymbolState {
    pub key: BarKey,
    pub slot: PositionSlot,
    pub ledger: TradeLedger,
    last_bar_ts: Option<i64>,
}

impl SymbolState {
    pub fn new(key: BarKey, ledger: TradeLedger) -> Self {
        Self {
            key,
            slot: PositionSlot::new(),
            ledger,
            last_bar_ts: None,
        }
    }

    pub fn last_bar_timestamp(&self) -> Option<i64> {
        self.last_bar_ts
    }
}

enum OpenAttempt {
    Opened(TradeRecord),
    Declined(String),
    Blocked(String),
}

// =============================================================================
// Engine
// =============================================================================

/// Immutable decision logic built from one configuration snapshot.
pub struct DecisionEngine {
    config: Arc<EngineConfig>,
    aggregator: Aggregator,
    gate: EntryGate,
}

impl DecisionEngine {
    pub fn new(config: Arc<EngineConfig>, mode: ReplayMode) -> EngineResult<Self> {
        let aggregator = Aggregator::new(&config)?;
        let gate = EntryGate::new(&config, mode);
        info!(mode = %mode, fingerprint = %config.fingerprint(), "decision engine built");
        Ok(Self {
            config,
            aggregator,
            gate,
        })
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn mode(&self) -> ReplayMode {
        self.gate.mode()
    }

    /// Run one decision for `state` on the current bar of `data`.
    pub fn step(&self, state: &mut SymbolState, data: &StepData, risk: &RiskSnapshot) -> StepOutcome {
        let Some(bar) = data.current_bar().copied() else {
            return StepOutcome::skip("empty bar window");
        };
        let span = info_span!("step", symbol = %data.key.symbol, ts = bar.timestamp);
        let _enter = span.enter();

        if data.key != state.key {
            let err = EngineError::InvariantViolation(format!(
                "step data for {} routed to {}",
                data.key, state.key
            ));
            error!(error = %err, "step rejected");
            return StepOutcome::skip(err.to_string());
        }
        if !bar.is_valid() {
            warn!("current bar invalid; step skipped");
            return StepOutcome::skip(format!("invalid bar at {}", bar.timestamp));
        }
        if let Some(last) = state.last_bar_ts {
            if bar.timestamp <= last {
                debug!(last, "bar already processed");
                return StepOutcome::skip(format!("bar {} already processed", bar.timestamp));
            }
        }

        let regime = classify(&data.bars, &self.config.regime);
        let decision = self.aggregator.aggregate(&data.signals, regime.regime);
        state.last_bar_ts = Some(bar.timestamp);

        let mut report = StepReport {
            bar_timestamp: bar.timestamp,
            regime,
            decision,
            opened: None,
            closed: None,
            note: None,
            raw: data
                .signals
                .raw
                .iter()
                .filter(|(_, v)| v.is_finite())
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        };

        // ── OPEN: exit state machine ─────────────────────────────────────
        if state.slot.is_open() {
            state.slot.tick();
            let Some(position) = state.slot.current().cloned() else {
                return StepOutcome::Ok(report);
            };
            let exit_params = &self.config.profile(position.entry_regime).exit;
            let Some(signal) = exit::evaluate(
                &position,
                report.decision.final_direction,
                report.decision.final_confidence,
                bar.close,
                exit_params,
                self.config.ledger.scratch_materiality_pct,
            ) else {
                return StepOutcome::Ok(report);
            };

            let record = close_record(&position, &signal, &bar, &report, data);
            if let Err(e) = state.ledger.record_close(record.clone()) {
                return StepOutcome::Blocked {
                    reason: e.to_string(),
                    report,
                };
            }
            if let Err(e) = state.slot.close() {
                return StepOutcome::Blocked {
                    reason: e.to_string(),
                    report,
                };
            }
            report.closed = Some(record);

            if signal.reason == ExitReason::Reverse && exit_params.reopen_on_reverse {
                match self.try_open(state, data, &bar, &report, risk) {
                    OpenAttempt::Opened(rec) => report.opened = Some(rec),
                    OpenAttempt::Declined(why) | OpenAttempt::Blocked(why) => {
                        report.note = Some(format!("reverse re-open skipped: {why}"));
                    }
                }
            }
            return StepOutcome::Ok(report);
        }

        // ── FLAT: entry gate ─────────────────────────────────────────────
        match self.try_open(state, data, &bar, &report, risk) {
            OpenAttempt::Opened(rec) => {
                report.opened = Some(rec);
                StepOutcome::Ok(report)
            }
            OpenAttempt::Declined(why) => {
                report.note = Some(why);
                StepOutcome::Ok(report)
            }
            OpenAttempt::Blocked(reason) => StepOutcome::Blocked { reason, report },
        }
    }

    fn try_open(
        &self,
        state: &mut SymbolState,
        data: &StepData,
        bar: &Bar,
        report: &StepReport,
        risk: &RiskSnapshot,
    ) -> OpenAttempt {
        let decision = &report.decision;
        let request = EntryRequest {
            regime: report.regime.regime,
            direction: decision.final_direction,
            confidence: decision.final_confidence,
            volatility: report.regime.metrics.atr_pct,
            now: data.now,
            position_open: state.slot.is_open(),
        };

        let plan = match self.gate.evaluate(&request, &state.ledger, risk) {
            EntryVerdict::Pass(plan) => plan,
            EntryVerdict::Decline(why) => return OpenAttempt::Declined(why),
            EntryVerdict::Blocked(why) => return OpenAttempt::Blocked(why),
        };

        let position = Position {
            trade_id: Position::trade_id_for(&state.key.symbol, bar.timestamp),
            symbol: state.key.symbol.clone(),
            direction: plan.direction,
            entry_price: bar.close,
            entry_timestamp: bar.timestamp,
            bars_open: 0,
            notional: plan.sizing.sized_notional,
            entry_regime: request.regime,
            entry_confidence: request.confidence,
        };
        let record = TradeRecord {
            record_id: format!("{}:open", position.trade_id),
            trade_id: position.trade_id.clone(),
            symbol: position.symbol.clone(),
            timeframe: state.key.timeframe.clone(),
            event: TradeEvent::Open,
            direction: position.direction,
            price: position.entry_price,
            bar_timestamp: bar.timestamp,
            regime: request.regime,
            confidence: request.confidence,
            notional: position.notional,
            entry_price: None,
            exit_reason: None,
            pct: None,
            is_scratch: None,
            bars_held: None,
            recorded_at: data.now,
        };

        if let Err(e) = state.slot.open(position) {
            return OpenAttempt::Blocked(e.to_string());
        }
        if let Err(e) = state.ledger.record_open(record.clone()) {
            // Keep slot and ledger in agreement.
            if let Err(rollback) = state.slot.close() {
                error!(
                    trade_id = %record.trade_id,
                    error = %rollback,
                    "INVARIANT: slot rollback failed after ledger rejected open"
                );
            }
            return OpenAttempt::Blocked(e.to_string());
        }
        OpenAttempt::Opened(record)
    }
}

fn close_record(
    position: &Position,
    signal: &ExitSignal,
    bar: &Bar,
    report: &StepReport,
    data: &StepData,
) -> TradeRecord {
    TradeRecord {
        record_id: format!("{}:close", position.trade_id),
        trade_id: position.trade_id.clone(),
        symbol: position.symbol.clone(),
        timeframe: data.key.timeframe.clone(),
        event: TradeEvent::Close,
        direction: position.direction,
        price: signal.exit_price,
        bar_timestamp: bar.timestamp,
        regime: report.regime.regime,
        confidence: report.decision.final_confidence,
        notional: position.notional,
        entry_price: Some(position.entry_price),
        exit_reason: Some(signal.reason),
        pct: Some(signal.pct),
        is_scratch: Some(signal.is_scratch),
        bars_held: Some(position.bars_open),
        recorded_at: data.now,
    }
}

// =============================================================================
// Fetch + step
// =============================================================================

/// Fetch inputs, take one risk snapshot, step, and feed any close back into
/// the risk book. A failed fetch skips the step without touching `state`.
pub fn run_step(
    engine: &DecisionEngine,
    state: &mut SymbolState,
    source: &dyn MarketDataSource,
    now: i64,
    book: &RiskBook,
) -> StepOutcome {
    let cfg = engine.config();
    let data = match fetch_step_data(
        source,
        &state.key,
        now,
        cfg.data.window_bars,
        cfg.data.max_signal_lag_ms,
    ) {
        Ok(data) => data,
        Err(e) => {
            warn!(symbol = %state.key, error = %e, "step skipped");
            return StepOutcome::skip(e.to_string());
        }
    };

    let risk = book.snapshot();
    let outcome = engine.step(state, &data, &risk);
    if let Some(closed) = outcome.closed() {
        book.record_close(
            closed.pct.unwrap_or(0.0),
            closed.is_scratch.unwrap_or(false),
            cfg.sizing.pf_block_min_samples,
            now,
        );
    }
    outcome
}
