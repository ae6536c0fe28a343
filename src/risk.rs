// =============================================================================
// Risk Engine: snapshot, multiplier and hard-block sizing
// =============================================================================
//
// Shared risk data (profit factor, drawdown, edge tables, blind spots) is
// published as an immutable `Arc<RiskSnapshot>`. A step clones the Arc once
// and never sees a half-updated record.
//
// Sizing multiplier = pf · drawdown · edge · volatility · confidence factors,
// each sanitised to a finite range, product clamped to [0.2, 2.0].
//
// Hard blocks (checked before sizing; any one denies the trade):
//   1. profit factor below the floor
//   2. regime edge strongly negative with enough sample
//   3. blind-spot regime with low confidence
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ledger::LedgerStats;
use crate::regime::Regime;
use crate::runtime_config::SizingParams;

pub const MIN_MULTIPLIER: f64 = 0.2;
pub const MAX_MULTIPLIER: f64 = 2.0;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Expected return per trade (%) measured over `samples` trades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeStat {
    pub edge_pct: f64,
    pub samples: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSnapshot {
    pub profit_factor: f64,
    /// Fraction, 0.0 = at peak.
    pub drawdown: f64,
    /// Material closes behind `profit_factor`.
    pub sample_size: u32,
    /// Keyed by confidence decile 0..=9.
    #[serde(default)]
    pub edge_by_confidence: BTreeMap<u8, EdgeStat>,
    #[serde(default)]
    pub edge_by_regime: BTreeMap<Regime, EdgeStat>,
    #[serde(default)]
    pub blind_spots: BTreeSet<Regime>,
    #[serde(default)]
    pub refreshed_at: i64,
}

impl Default for RiskSnapshot {
    fn default() -> Self {
        Self {
            profit_factor: 1.0,
            drawdown: 0.0,
            sample_size: 0,
            edge_by_confidence: BTreeMap::new(),
            edge_by_regime: BTreeMap::new(),
            blind_spots: BTreeSet::new(),
            refreshed_at: 0,
        }
    }
}

/// Read a base snapshot (edge tables, blind spots, starting PF) from JSON.
/// Absent fields take their defaults.
pub fn load_risk_snapshot(path: impl AsRef<Path>) -> Result<RiskSnapshot> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read risk snapshot from {}", path.display()))?;
    let snapshot: RiskSnapshot = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse risk snapshot from {}", path.display()))?;
    info!(
        path = %path.display(),
        pf = snapshot.profit_factor,
        regimes = snapshot.edge_by_regime.len(),
        blind_spots = snapshot.blind_spots.len(),
        "base risk snapshot loaded"
    );
    Ok(snapshot)
}

pub fn confidence_decile(confidence: f64) -> u8 {
    if !confidence.is_finite() {
        return 0;
    }
    (confidence * 10.0).floor().clamp(0.0, 9.0) as u8
}

impl RiskSnapshot {
    /// Mean of the confidence-decile edge and the regime edge, over whichever
    /// of the two exist. 0.0 when neither does.
    pub fn combined_edge(&self, regime: Regime, confidence: f64) -> f64 {
        let parts: Vec<f64> = [
            self.edge_by_confidence.get(&confidence_decile(confidence)),
            self.edge_by_regime.get(&regime),
        ]
        .into_iter()
        .flatten()
        .map(|e| e.edge_pct)
        .filter(|e| e.is_finite())
        .collect();
        if parts.is_empty() {
            0.0
        } else {
            parts.iter().sum::<f64>() / parts.len() as f64
        }
    }
}

/// Read-mostly holder of the current snapshot.
pub struct SharedRisk {
    current: RwLock<Arc<RiskSnapshot>>,
}

impl SharedRisk {
    pub fn new(initial: RiskSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<RiskSnapshot> {
        self.current.read().clone()
    }

    /// Replace PF, drawdown and sample size from realized stats; edge tables
    /// and blind spots are external data and are kept.
    ///
    /// The realized PF is only published once `pf_min_samples` material
    /// closes exist. Until then the supplied value (neutral 1.0 unless a base
    /// snapshot said otherwise) stays in place, so one early loss cannot push
    /// a fresh ledger under the hard-block floor.
    pub fn refresh_from_stats(&self, stats: &LedgerStats, pf_min_samples: u32, now: i64) {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        if stats.material_trades() >= pf_min_samples {
            next.profit_factor = stats.profit_factor();
        }
        next.drawdown = stats.drawdown;
        next.sample_size = stats.material_trades();
        next.refreshed_at = now;
        debug!(
            pf = next.profit_factor,
            drawdown = next.drawdown,
            samples = next.sample_size,
            "risk snapshot refreshed"
        );
        *guard = Arc::new(next);
    }
}

/// Realized stats feeding one `SharedRisk`. Live shares one book across all
/// symbols; each replay run owns its own.
pub struct RiskBook {
    stats: Mutex<LedgerStats>,
    shared: Arc<SharedRisk>,
}

impl RiskBook {
    pub fn new(base: RiskSnapshot) -> Self {
        Self {
            stats: Mutex::new(LedgerStats::default()),
            shared: Arc::new(SharedRisk::new(base)),
        }
    }

    pub fn snapshot(&self) -> Arc<RiskSnapshot> {
        self.shared.snapshot()
    }

    pub fn record_close(&self, pct: f64, is_scratch: bool, pf_min_samples: u32, now: i64) {
        let mut stats = self.stats.lock();
        stats.record_close(pct, is_scratch);
        self.shared.refresh_from_stats(&stats, pf_min_samples, now);
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Multiplier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskContext {
    pub pf_local: f64,
    pub drawdown: f64,
    /// Combined expected edge, % per trade.
    pub edge_estimate: f64,
    /// ATR as % of price.
    pub volatility: f64,
    pub confidence: f64,
}

fn pf_factor(pf: f64, p: &SizingParams) -> f64 {
    if !pf.is_finite() {
        return 1.0;
    }
    if pf >= p.pf_strong {
        p.pf_strong_factor
    } else if pf < p.pf_floor {
        p.pf_weak_factor
    } else {
        1.0
    }
}

fn drawdown_factor(dd: f64, p: &SizingParams) -> f64 {
    if !dd.is_finite() {
        return p.drawdown_min_factor;
    }
    let depth = (dd.max(0.0) / p.max_drawdown).min(1.0);
    1.0 - depth * (1.0 - p.drawdown_min_factor)
}

fn edge_factor(edge: f64, p: &SizingParams) -> f64 {
    if !edge.is_finite() {
        return 1.0;
    }
    1.0 + (edge / p.edge_scale_pct).clamp(-0.5, 0.5)
}

fn volatility_factor(vol: f64, p: &SizingParams) -> f64 {
    if !vol.is_finite() || vol < 0.0 {
        return p.vol_min_factor;
    }
    if vol <= p.vol_high_pct {
        1.0
    } else {
        (p.vol_high_pct / vol).max(p.vol_min_factor)
    }
}

fn confidence_factor(confidence: f64, p: &SizingParams) -> f64 {
    if confidence.is_finite() && confidence >= p.confident_level {
        p.confident_factor
    } else {
        1.0
    }
}

/// Always within `[MIN_MULTIPLIER, MAX_MULTIPLIER]`.
pub fn risk_multiplier(ctx: &RiskContext, params: &SizingParams) -> f64 {
    let raw = [
        pf_factor(ctx.pf_local, params),
        drawdown_factor(ctx.drawdown, params),
        edge_factor(ctx.edge_estimate, params),
        volatility_factor(ctx.volatility, params),
        confidence_factor(ctx.confidence, params),
    ]
    .iter()
    .map(|f| if f.is_finite() { f.clamp(0.0, MAX_MULTIPLIER) } else { 1.0 })
    .product::<f64>();

    if raw.is_finite() {
        raw.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
    } else {
        MIN_MULTIPLIER
    }
}

// ---------------------------------------------------------------------------
// Hard block
// ---------------------------------------------------------------------------

/// Reason the trade must not be taken at any size, if any.
pub fn hard_block(
    regime: Regime,
    confidence: f64,
    snapshot: &RiskSnapshot,
    params: &SizingParams,
) -> Option<String> {
    let pf = snapshot.profit_factor;
    if !(pf >= params.pf_block_floor) {
        return Some(format!(
            "profit factor {pf:.2} below floor {:.2} over {} trades",
            params.pf_block_floor, snapshot.sample_size
        ));
    }

    if let Some(edge) = snapshot.edge_by_regime.get(&regime) {
        if edge.samples >= params.regime_block_min_samples && edge.edge_pct <= params.regime_block_edge_pct {
            return Some(format!(
                "{regime} edge {:.3}% over {} trades",
                edge.edge_pct, edge.samples
            ));
        }
    }

    if snapshot.blind_spots.contains(&regime) && !(confidence >= params.blind_spot_min_confidence) {
        return Some(format!(
            "{regime} is a blind spot and confidence {confidence:.2} < {:.2}",
            params.blind_spot_min_confidence
        ));
    }

    None
}

// ---------------------------------------------------------------------------
// Sizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingDecision {
    pub allow: bool,
    pub sized_notional: f64,
    pub multiplier: f64,
    pub reason: String,
    pub context: RiskContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskSizer {
    params: SizingParams,
}

impl RiskSizer {
    pub fn new(params: SizingParams) -> Self {
        Self { params }
    }

    pub fn size(
        &self,
        regime: Regime,
        confidence: f64,
        volatility: f64,
        snapshot: &RiskSnapshot,
    ) -> SizingDecision {
        let context = RiskContext {
            pf_local: snapshot.profit_factor,
            drawdown: snapshot.drawdown,
            edge_estimate: snapshot.combined_edge(regime, confidence),
            volatility,
            confidence,
        };

        if let Some(reason) = hard_block(regime, confidence, snapshot, &self.params) {
            info!(regime = %regime, confidence, reason = %reason, "sizing hard-blocked");
            return SizingDecision {
                allow: false,
                sized_notional: 0.0,
                multiplier: 0.0,
                reason,
                context,
            };
        }

        let multiplier = risk_multiplier(&context, &self.params);
        let sized_notional = self.params.base_notional * multiplier;
        debug!(
            regime = %regime,
            multiplier,
            sized_notional,
            pf = context.pf_local,
            drawdown = context.drawdown,
            edge = context.edge_estimate,
            "position sized"
        );
        SizingDecision {
            allow: true,
            sized_notional,
            multiplier,
            reason: format!("multiplier {multiplier:.3}"),
            context,
        }
    }
}
