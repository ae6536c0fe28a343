// =============================================================================
// Decision Envelope: Auditable record of every step's decision
// =============================================================================
//
// Each step that reached the aggregator produces a `DecisionTrace`: regime and
// its metrics, the per-bucket breakdown, the final direction/confidence, and
// what the step did about it. Traces are kept in a bounded ring for
// observability tooling and written to `decisions.jsonl` by replays.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::StepOutcome;
use crate::exit::ExitReason;
use crate::market_data::BarKey;
use crate::regime::{Regime, RegimeMetrics};
use crate::signals::BucketScore;
use crate::types::Direction;

/// Default number of traces retained.
pub const MAX_RECENT_DECISIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Ok,
    Skip,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub timeframe: String,
    pub bar_timestamp: i64,
    pub recorded_at: i64,
    pub regime: Regime,
    pub metrics: RegimeMetrics,
    pub buckets: Vec<BucketScore>,
    pub final_direction: Direction,
    pub final_confidence: f64,
    pub final_score: f64,
    pub neutral_forced: bool,
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    /// Raw readings behind the normalised signals.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw: BTreeMap<String, f64>,
}

impl DecisionTrace {
    /// `None` for skipped steps, which never reached a decision.
    pub fn from_outcome(key: &BarKey, now: i64, outcome: &StepOutcome) -> Option<Self> {
        let report = outcome.report()?;
        let decision = &report.decision;
        let closed = report.closed.as_ref();
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
            bar_timestamp: report.bar_timestamp,
            recorded_at: now,
            regime: report.regime.regime,
            metrics: report.regime.metrics,
            buckets: decision.bucket_breakdown.clone(),
            final_direction: decision.final_direction,
            final_confidence: decision.final_confidence,
            final_score: decision.final_score,
            neutral_forced: decision.neutral_forced,
            outcome: outcome.kind(),
            reason: outcome.reason().map(str::to_string),
            opened: report.opened.as_ref().map(|r| r.trade_id.clone()),
            closed: closed.map(|r| r.trade_id.clone()),
            exit_reason: closed.and_then(|r| r.exit_reason),
            raw: report.raw.clone(),
        })
    }
}

/// Bounded, oldest-evicted ring of recent traces.
pub struct DecisionLog {
    capacity: usize,
    entries: RwLock<VecDeque<DecisionTrace>>,
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, trace: DecisionTrace) {
        let mut entries = self.entries.write();
        entries.push_back(trace);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Newest last.
    pub fn recent(&self, n: usize) -> Vec<DecisionTrace> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new(MAX_RECENT_DECISIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepReport;
    use crate::regime::RegimeResult;
    use crate::signals::Decision;

    fn report(ts: i64) -> StepReport {
        StepReport {
            bar_timestamp: ts,
            regime: RegimeResult {
                regime: Regime::Chop,
                metrics: RegimeMetrics::default(),
            },
            decision: Decision {
                final_direction: Direction::Flat,
                final_confidence: 0.0,
                final_score: 0.02,
                bucket_breakdown: Vec::new(),
                regime: Regime::Chop,
                neutral_forced: true,
            },
            opened: None,
            closed: None,
            note: None,
            raw: BTreeMap::new(),
        }
    }

    #[test]
    fn ring_evicts_oldest() {
        let log = DecisionLog::new(3);
        let key = BarKey::new("BTCUSDT", "5m");
        for ts in 0..5 {
            let outcome = StepOutcome::Ok(report(ts));
            log.push(DecisionTrace::from_outcome(&key, ts, &outcome).unwrap());
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].bar_timestamp, 2);
        assert_eq!(recent[2].bar_timestamp, 4);
        assert_eq!(log.recent(1)[0].bar_timestamp, 4);
    }

    #[test]
    fn skip_produces_no_trace_blocked_keeps_reason() {
        let key = BarKey::new("BTCUSDT", "5m");
        let skip = StepOutcome::Skip {
            reason: "no bars".into(),
        };
        assert!(DecisionTrace::from_outcome(&key, 0, &skip).is_none());

        let blocked = StepOutcome::Blocked {
            reason: "cooldown".into(),
            report: report(7),
        };
        let trace = DecisionTrace::from_outcome(&key, 9, &blocked).unwrap();
        assert_eq!(trace.outcome, OutcomeKind::Blocked);
        assert_eq!(trace.reason.as_deref(), Some("cooldown"));
        assert_eq!(trace.recorded_at, 9);
    }

    #[test]
    fn raw_readings_are_traced_only_when_present() {
        let key = BarKey::new("BTCUSDT", "5m");
        let bare = DecisionTrace::from_outcome(&key, 1, &StepOutcome::Ok(report(1))).unwrap();
        let json = serde_json::to_string(&bare).unwrap();
        assert!(!json.contains("\"raw\""));

        let mut with_raw = report(2);
        with_raw.raw.insert("funding_rate".into(), 0.0004);
        let trace = DecisionTrace::from_outcome(&key, 2, &StepOutcome::Ok(with_raw)).unwrap();
        let back: DecisionTrace = serde_json::from_str(&serde_json::to_string(&trace).unwrap()).unwrap();
        assert_eq!(back.raw["funding_rate"], 0.0004);
    }
}
