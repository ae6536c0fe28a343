// =============================================================================
// Entry Gate: ordered checks before a position may open
// =============================================================================
//
// Criteria (a failure means "no trade", a normal outcome):
//   1. RegimeAllowed   regime is on the allow-list (analytical replay: all)
//   2. HasDirection    final direction is not flat
//   3. Threshold       confidence >= clamp(threshold(regime) + band adj.)
//
// Guardrails (a failure is a block, reported with its reason):
//   4. Cooldown        no open within `cooldown_secs` of the last open
//   5. LossCluster     fewer than N material losses inside the lookback
//   6. NoPosition      no position already open for the symbol
//   7. RiskSizer       no hard block; sizes the notional
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ledger::TradeLedger;
use crate::regime::Regime;
use crate::risk::{RiskSizer, RiskSnapshot, SizingDecision};
use crate::runtime_config::{EngineConfig, EntryParams, RiskBandParams};
use crate::types::{Direction, ReplayMode};

// ---------------------------------------------------------------------------
// Risk band
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    Normal,
    Elevated,
    Defensive,
}

impl RiskBand {
    pub fn from_drawdown(drawdown: f64, params: &RiskBandParams) -> Self {
        if !drawdown.is_finite() || drawdown >= params.defensive_drawdown {
            Self::Defensive
        } else if drawdown >= params.elevated_drawdown {
            Self::Elevated
        } else {
            Self::Normal
        }
    }

    pub fn threshold_adjustment(self, params: &RiskBandParams) -> f64 {
        match self {
            Self::Normal => 0.0,
            Self::Elevated => params.elevated_adjustment,
            Self::Defensive => params.defensive_adjustment,
        }
    }
}

impl std::fmt::Display for RiskBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Elevated => write!(f, "elevated"),
            Self::Defensive => write!(f, "defensive"),
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub direction: Direction,
    pub threshold: f64,
    pub band: RiskBand,
    pub sizing: SizingDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryVerdict {
    Pass(EntryPlan),
    /// Entry criteria not met.
    Decline(String),
    /// Criteria met but a guardrail or the sizer refused.
    Blocked(String),
}

/// What the gate needs to know about this step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryRequest {
    pub regime: Regime,
    pub direction: Direction,
    pub confidence: f64,
    /// ATR as % of price, used for sizing.
    pub volatility: f64,
    pub now: i64,
    pub position_open: bool,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EntryGate {
    params: EntryParams,
    bands: RiskBandParams,
    allowed: BTreeMap<Regime, bool>,
    thresholds: BTreeMap<Regime, f64>,
    mode: ReplayMode,
    sizer: RiskSizer,
}

impl EntryGate {
    pub fn new(config: &EngineConfig, mode: ReplayMode) -> Self {
        let allowed = Regime::ALL
            .iter()
            .map(|r| (*r, config.profile(*r).allow_entry))
            .collect();
        let thresholds = Regime::ALL
            .iter()
            .map(|r| (*r, config.profile(*r).entry_threshold))
            .collect();
        Self {
            params: config.entry.clone(),
            bands: config.risk_bands.clone(),
            allowed,
            thresholds,
            mode,
            sizer: RiskSizer::new(config.sizing.clone()),
        }
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn regime_allowed(&self, regime: Regime) -> bool {
        match self.mode {
            ReplayMode::Analytical => true,
            ReplayMode::Standard => self.allowed.get(&regime).copied().unwrap_or(false),
        }
    }

    pub fn effective_threshold(&self, regime: Regime, band: RiskBand) -> f64 {
        let base = self.thresholds.get(&regime).copied().unwrap_or(self.params.threshold_ceiling);
        (base + band.threshold_adjustment(&self.bands))
            .clamp(self.params.threshold_floor, self.params.threshold_ceiling)
    }

    pub fn evaluate(
        &self,
        req: &EntryRequest,
        ledger: &TradeLedger,
        risk: &RiskSnapshot,
    ) -> EntryVerdict {
        // 1. Regime allow-list
        if !self.regime_allowed(req.regime) {
            return EntryVerdict::Decline(format!("regime {} not allowed to open", req.regime));
        }

        // 2. Direction
        if req.direction.is_flat() {
            return EntryVerdict::Decline("no direction".to_string());
        }

        // 3. Threshold
        let band = RiskBand::from_drawdown(risk.drawdown, &self.bands);
        let threshold = self.effective_threshold(req.regime, band);
        if !(req.confidence >= threshold) {
            return EntryVerdict::Decline(format!(
                "confidence {:.4} < threshold {:.4} ({band})",
                req.confidence, threshold
            ));
        }

        // 4. Cooldown
        if let Some(last) = ledger.last_open_at() {
            let elapsed = req.now - last;
            let cooldown_ms = self.params.cooldown_secs.saturating_mul(1000);
            if elapsed < cooldown_ms {
                return self.block(format!(
                    "cooldown: {}s since last open < {}s",
                    elapsed / 1000,
                    self.params.cooldown_secs
                ));
            }
        }

        // 5. Loss cluster
        if self.params.loss_cluster_count > 0 {
            let since = req.now - self.params.loss_cluster_lookback_secs.saturating_mul(1000);
            let losses = ledger.material_losses_since(since);
            if losses >= self.params.loss_cluster_count {
                return self.block(format!(
                    "loss cluster: {losses} losing exits in {}s",
                    self.params.loss_cluster_lookback_secs
                ));
            }
        }

        // 6. Existing position
        if req.position_open || ledger.open_trade().is_some() {
            return self.block(format!("{} already has an open position", ledger.symbol()));
        }

        // 7. Sizing / hard block
        let sizing = self
            .sizer
            .size(req.regime, req.confidence, req.volatility, risk);
        if !sizing.allow {
            return self.block(format!("risk: {}", sizing.reason));
        }

        debug!(
            regime = %req.regime,
            direction = %req.direction,
            confidence = req.confidence,
            threshold,
            band = %band,
            "all entry gates passed"
        );
        EntryVerdict::Pass(EntryPlan {
            direction: req.direction,
            threshold,
            band,
            sizing,
        })
    }

    fn block(&self, reason: String) -> EntryVerdict {
        info!(reason = %reason, "entry blocked by guardrail");
        EntryVerdict::Blocked(reason)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::ExitReason;
    use crate::ledger::{TradeEvent, TradeRecord};

    fn request(regime: Regime, direction: Direction, confidence: f64, now: i64) -> EntryRequest {
        EntryRequest {
            regime,
            direction,
            confidence,
            volatility: 1.0,
            now,
            position_open: false,
        }
    }

    fn gate(mode: ReplayMode) -> EntryGate {
        EntryGate::new(&EngineConfig::default(), mode)
    }

    fn record(id: &str, event: TradeEvent, at: i64, pct: Option<f64>) -> TradeRecord {
        TradeRecord {
            record_id: format!("{id}:{event:?}"),
            trade_id: id.to_string(),
            symbol: "BTCUSDT".into(),
            timeframe: "5m".into(),
            event,
            direction: Direction::Long,
            price: 100.0,
            bar_timestamp: at,
            regime: Regime::TrendUp,
            confidence: 0.6,
            notional: 1_000.0,
            entry_price: pct.map(|_| 100.0),
            exit_reason: pct.map(|_| ExitReason::Sl),
            pct,
            is_scratch: pct.map(|_| false),
            bars_held: None,
            recorded_at: at,
        }
    }

    #[test]
    fn trend_down_above_threshold_passes() {
        let (ledger, _) = TradeLedger::in_memory("BTCUSDT", 50);
        let v = gate(ReplayMode::Standard).evaluate(
            &request(Regime::TrendDown, Direction::Short, 0.60, 0),
            &ledger,
            &RiskSnapshot::default(),
        );
        match v {
            EntryVerdict::Pass(plan) => {
                assert_eq!(plan.threshold, 0.52);
                assert_eq!(plan.direction, Direction::Short);
                assert!(plan.sizing.allow);
                assert!(plan.sizing.sized_notional > 0.0);
            }
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[test]
    fn allow_list_widens_only_in_analytical_mode() {
        let (ledger, _) = TradeLedger::in_memory("BTCUSDT", 50);
        let req = request(Regime::Chop, Direction::Long, 0.9, 0);
        let risk = RiskSnapshot::default();
        assert!(matches!(
            gate(ReplayMode::Standard).evaluate(&req, &ledger, &risk),
            EntryVerdict::Decline(_)
        ));
        assert!(matches!(
            gate(ReplayMode::Analytical).evaluate(&req, &ledger, &risk),
            EntryVerdict::Pass(_)
        ));
    }

    #[test]
    fn flat_and_weak_signals_decline() {
        let (ledger, _) = TradeLedger::in_memory("BTCUSDT", 50);
        let g = gate(ReplayMode::Standard);
        let risk = RiskSnapshot::default();
        assert!(matches!(
            g.evaluate(&request(Regime::TrendUp, Direction::Flat, 0.9, 0), &ledger, &risk),
            EntryVerdict::Decline(_)
        ));
        assert!(matches!(
            g.evaluate(&request(Regime::TrendUp, Direction::Long, 0.51, 0), &ledger, &risk),
            EntryVerdict::Decline(_)
        ));
    }

    #[test]
    fn risk_band_raises_threshold_within_bounds() {
        let g = gate(ReplayMode::Standard);
        assert_eq!(g.effective_threshold(Regime::TrendUp, RiskBand::Normal), 0.52);
        assert!((g.effective_threshold(Regime::TrendUp, RiskBand::Defensive) - 0.58).abs() < 1e-12);

        let (ledger, _) = TradeLedger::in_memory("BTCUSDT", 50);
        let risk = RiskSnapshot {
            drawdown: 0.12,
            ..RiskSnapshot::default()
        };
        assert!(matches!(
            g.evaluate(&request(Regime::TrendUp, Direction::Long, 0.55, 0), &ledger, &risk),
            EntryVerdict::Decline(_)
        ));
    }

    #[test]
    fn cooldown_blocks_then_expires() {
        let (mut ledger, _) = TradeLedger::in_memory("BTCUSDT", 50);
        ledger.record_open(record("t1", TradeEvent::Open, 0, None)).unwrap();
        ledger.record_close(record("t1", TradeEvent::Close, 60_000, Some(0.5))).unwrap();

        let g = gate(ReplayMode::Standard);
        let risk = RiskSnapshot::default();
        let early = g.evaluate(&request(Regime::TrendUp, Direction::Long, 0.7, 300_000), &ledger, &risk);
        assert!(matches!(early, EntryVerdict::Blocked(ref r) if r.starts_with("cooldown")));
        let later = g.evaluate(&request(Regime::TrendUp, Direction::Long, 0.7, 900_000), &ledger, &risk);
        assert!(matches!(later, EntryVerdict::Pass(_)));
    }

    #[test]
    fn loss_cluster_blocks_inside_lookback() {
        let (mut ledger, _) = TradeLedger::in_memory("BTCUSDT", 50);
        for i in 0..3 {
            let id = format!("t{i}");
            let at = i * 1_000_000;
            ledger.record_open(record(&id, TradeEvent::Open, at, None)).unwrap();
            ledger.record_close(record(&id, TradeEvent::Close, at + 500_000, Some(-0.8))).unwrap();
        }
        let g = gate(ReplayMode::Standard);
        let risk = RiskSnapshot::default();
        let now = 4_000_000;
        let v = g.evaluate(&request(Regime::TrendUp, Direction::Long, 0.7, now), &ledger, &risk);
        assert!(matches!(v, EntryVerdict::Blocked(ref r) if r.starts_with("loss cluster")));

        // Eight hours later the losses have aged out.
        let v = g.evaluate(
            &request(Regime::TrendUp, Direction::Long, 0.7, now + 8 * 3_600_000),
            &ledger,
            &risk,
        );
        assert!(matches!(v, EntryVerdict::Pass(_)));
    }

    #[test]
    fn existing_position_blocks() {
        let (ledger, _) = TradeLedger::in_memory("BTCUSDT", 50);
        let mut req = request(Regime::TrendUp, Direction::Long, 0.7, 0);
        req.position_open = true;
        assert!(matches!(
            gate(ReplayMode::Standard).evaluate(&req, &ledger, &RiskSnapshot::default()),
            EntryVerdict::Blocked(_)
        ));
    }

    #[test]
    fn profit_factor_floor_blocks_any_confidence() {
        let (ledger, _) = TradeLedger::in_memory("BTCUSDT", 50);
        let risk = RiskSnapshot {
            profit_factor: 0.2,
            sample_size: 40,
            ..RiskSnapshot::default()
        };
        let v = gate(ReplayMode::Standard).evaluate(
            &request(Regime::TrendUp, Direction::Long, 0.99, 0),
            &ledger,
            &risk,
        );
        assert!(matches!(v, EntryVerdict::Blocked(ref r) if r.starts_with("risk")));
    }
}
