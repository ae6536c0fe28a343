// =============================================================================
// Runtime Configuration: Hot-reloadable decision settings with atomic save
// =============================================================================
//
// Every tunable threshold, weight and guardrail lives here. Nothing in the
// decision path hardcodes a numeric cut-off; it reads one of these fields.
//
// All fields carry `#[serde(default)]` so that older files missing new keys
// still load. Values that parse but are out of range are repaired by
// `EngineConfig::validated`, which falls back to the documented default for
// that field and reports a `ConfigIssue`.
//
// Persistence uses an atomic tmp + rename pattern.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::regime::Regime;
use crate::signals::Bucket;

// =============================================================================
// Regime classifier parameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeParams {
    /// Trailing bars inspected by the classifier.
    pub window: usize,
    /// Below this many bars the classifier answers `chop`.
    pub min_bars: usize,
    /// Bars used for the short slope.
    pub short_slope_bars: usize,
    pub atr_short_period: usize,
    pub atr_long_period: usize,
    /// ATR as % of price above which the window is `high_vol`.
    pub high_vol_atr_pct: f64,
    /// Recent/long ATR ratio above which the window is `high_vol`.
    pub high_vol_atr_ratio: f64,
    /// Absolute % change across the window required for a trend.
    pub trend_pct_change: f64,
    /// Fallback trend detection accepts this fraction of `trend_pct_change`
    /// when both slopes agree.
    pub fallback_pct_fraction: f64,
    /// Minimum |medium slope| (% per bar) for the fallback.
    pub fallback_min_slope: f64,
}

impl Default for RegimeParams {
    fn default() -> Self {
        Self {
            window: 20,
            min_bars: 5,
            short_slope_bars: 5,
            atr_short_period: 5,
            atr_long_period: 14,
            high_vol_atr_pct: 3.5,
            high_vol_atr_ratio: 1.8,
            trend_pct_change: 1.5,
            fallback_pct_fraction: 0.5,
            fallback_min_slope: 0.05,
        }
    }
}

// =============================================================================
// Aggregator parameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorParams {
    /// `|final_score|` below this forces direction and confidence to zero.
    pub neutral_threshold: f64,
    /// Per-bucket dead-band around zero.
    pub bucket_deadband: f64,
    /// Decimal places kept on scores and confidences.
    pub confidence_precision: u32,
}

impl Default for AggregatorParams {
    fn default() -> Self {
        Self {
            neutral_threshold: 0.10,
            bucket_deadband: 0.05,
            confidence_precision: 4,
        }
    }
}

/// One `(signal, weight)` entry of a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalWeight {
    pub signal: String,
    pub weight: f64,
}

impl SignalWeight {
    pub fn new(signal: impl Into<String>, weight: f64) -> Self {
        Self {
            signal: signal.into(),
            weight,
        }
    }
}

pub fn default_bucket_spec() -> BTreeMap<Bucket, Vec<SignalWeight>> {
    let mut m = BTreeMap::new();
    m.insert(
        Bucket::Momentum,
        vec![
            SignalWeight::new("ema_cross", 0.4),
            SignalWeight::new("roc_10", 0.35),
            SignalWeight::new("macd_hist", 0.25),
        ],
    );
    m.insert(
        Bucket::MeanReversion,
        vec![
            SignalWeight::new("rsi_14", 0.5),
            SignalWeight::new("bb_zscore", 0.5),
        ],
    );
    m.insert(
        Bucket::Flow,
        vec![
            SignalWeight::new("orderbook_imbalance", 0.5),
            SignalWeight::new("cvd_delta", 0.5),
        ],
    );
    m.insert(
        Bucket::Positioning,
        vec![
            SignalWeight::new("funding_rate", 0.4),
            SignalWeight::new("open_interest_change", 0.3),
            SignalWeight::new("long_short_ratio", 0.3),
        ],
    );
    m.insert(Bucket::Timing, vec![SignalWeight::new("session_bias", 1.0)]);
    m.insert(
        Bucket::Sentiment,
        vec![
            SignalWeight::new("fear_greed", 0.6),
            SignalWeight::new("news_tone", 0.4),
        ],
    );
    m.insert(
        Bucket::OnchainFlow,
        vec![
            SignalWeight::new("exchange_netflow", 0.6),
            SignalWeight::new("whale_transfers", 0.4),
        ],
    );
    m
}

// =============================================================================
// Exit parameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitParams {
    /// Opposite direction at or above this confidence closes immediately.
    pub stop_loss_confidence: f64,
    /// Same direction at or above this confidence takes profit after min-hold.
    pub take_profit_confidence: f64,
    /// Same direction at or above this confidence takes profit at any age.
    pub take_profit_fast_confidence: f64,
    /// Confidence below this drops the position after min-hold.
    pub exit_min_confidence: f64,
    /// Opposite direction at or above this confidence reverses after min-hold.
    pub reverse_confidence: f64,
    pub min_hold_bars: u32,
    /// Forced exit once a position has been open this many bars.
    pub decay_bars: u32,
    /// Re-run the entry gate in the new direction after a reverse exit.
    pub reopen_on_reverse: bool,
}

impl Default for ExitParams {
    fn default() -> Self {
        Self {
            stop_loss_confidence: 0.55,
            take_profit_confidence: 0.80,
            take_profit_fast_confidence: 0.88,
            exit_min_confidence: 0.20,
            reverse_confidence: 0.45,
            min_hold_bars: 4,
            decay_bars: 48,
            reopen_on_reverse: false,
        }
    }
}

// =============================================================================
// Per-regime profile
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeProfile {
    /// Whether the live allow-list lets this regime open positions.
    #[serde(default)]
    pub allow_entry: bool,
    /// NaN when absent from the file; `validated` fills it from the
    /// regime's default profile.
    #[serde(default = "unset_threshold")]
    pub entry_threshold: f64,
    /// Bucket weights; renormalised to sum to 1 on validation. Empty when
    /// absent, which validation replaces with the regime default.
    #[serde(default)]
    pub weights: BTreeMap<Bucket, f64>,
    /// Buckets zeroed out before weighting in this regime.
    #[serde(default)]
    pub mask: BTreeSet<Bucket>,
    #[serde(default)]
    pub exit: ExitParams,
}

fn unset_threshold() -> f64 {
    f64::NAN
}

impl RegimeProfile {
    pub fn default_for(regime: Regime) -> Self {
        let w = |pairs: [(Bucket, f64); 7]| pairs.into_iter().collect::<BTreeMap<_, _>>();
        match regime {
            Regime::TrendUp | Regime::TrendDown => Self {
                allow_entry: true,
                entry_threshold: 0.52,
                weights: w([
                    (Bucket::Momentum, 0.30),
                    (Bucket::MeanReversion, 0.05),
                    (Bucket::Flow, 0.20),
                    (Bucket::Positioning, 0.15),
                    (Bucket::Timing, 0.10),
                    (Bucket::Sentiment, 0.10),
                    (Bucket::OnchainFlow, 0.10),
                ]),
                mask: BTreeSet::new(),
                exit: ExitParams::default(),
            },
            Regime::HighVol => Self {
                allow_entry: false,
                entry_threshold: 0.62,
                weights: w([
                    (Bucket::Momentum, 0.15),
                    (Bucket::MeanReversion, 0.10),
                    (Bucket::Flow, 0.30),
                    (Bucket::Positioning, 0.20),
                    (Bucket::Timing, 0.10),
                    (Bucket::Sentiment, 0.05),
                    (Bucket::OnchainFlow, 0.10),
                ]),
                mask: BTreeSet::new(),
                exit: ExitParams {
                    stop_loss_confidence: 0.50,
                    min_hold_bars: 2,
                    decay_bars: 24,
                    ..ExitParams::default()
                },
            },
            Regime::Chop => Self {
                allow_entry: false,
                entry_threshold: 0.58,
                weights: w([
                    (Bucket::Momentum, 0.05),
                    (Bucket::MeanReversion, 0.35),
                    (Bucket::Flow, 0.20),
                    (Bucket::Positioning, 0.15),
                    (Bucket::Timing, 0.10),
                    (Bucket::Sentiment, 0.10),
                    (Bucket::OnchainFlow, 0.05),
                ]),
                mask: [Bucket::Momentum].into_iter().collect(),
                exit: ExitParams {
                    min_hold_bars: 3,
                    decay_bars: 24,
                    ..ExitParams::default()
                },
            },
        }
    }
}

fn default_regimes() -> BTreeMap<Regime, RegimeProfile> {
    Regime::ALL
        .iter()
        .map(|r| (*r, RegimeProfile::default_for(*r)))
        .collect()
}

// =============================================================================
// Entry guardrails and risk bands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryParams {
    /// Lowest effective entry threshold after risk-band adjustment.
    pub threshold_floor: f64,
    /// Highest effective entry threshold after risk-band adjustment.
    pub threshold_ceiling: f64,
    /// No new open within this many seconds of the previous open.
    pub cooldown_secs: i64,
    /// This many losing closes inside the lookback block new entries.
    pub loss_cluster_count: u32,
    pub loss_cluster_lookback_secs: i64,
}

impl Default for EntryParams {
    fn default() -> Self {
        Self {
            threshold_floor: 0.30,
            threshold_ceiling: 0.95,
            cooldown_secs: 900,
            loss_cluster_count: 3,
            loss_cluster_lookback_secs: 4 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskBandParams {
    /// Drawdown (fraction) at which the band becomes `elevated`.
    pub elevated_drawdown: f64,
    /// Drawdown (fraction) at which the band becomes `defensive`.
    pub defensive_drawdown: f64,
    /// Added to the entry threshold in the `elevated` band.
    pub elevated_adjustment: f64,
    /// Added to the entry threshold in the `defensive` band.
    pub defensive_adjustment: f64,
}

impl Default for RiskBandParams {
    fn default() -> Self {
        Self {
            elevated_drawdown: 0.05,
            defensive_drawdown: 0.10,
            elevated_adjustment: 0.03,
            defensive_adjustment: 0.06,
        }
    }
}

// =============================================================================
// Sizing parameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingParams {
    pub base_notional: f64,
    /// PF at or above this scales size up by `pf_strong_factor`.
    pub pf_strong: f64,
    pub pf_strong_factor: f64,
    /// PF below this scales size down by `pf_weak_factor`.
    pub pf_floor: f64,
    pub pf_weak_factor: f64,
    /// Drawdown (fraction) at which the drawdown factor bottoms out.
    pub max_drawdown: f64,
    pub drawdown_min_factor: f64,
    /// Expected edge (% per trade) that moves the edge factor by 100 %.
    pub edge_scale_pct: f64,
    /// ATR % above which size contracts.
    pub vol_high_pct: f64,
    pub vol_min_factor: f64,
    /// Confidence at or above which size expands by `confident_factor`.
    pub confident_level: f64,
    pub confident_factor: f64,
    /// PF below this hard-blocks entries.
    pub pf_block_floor: f64,
    /// Material closes required before the realized PF replaces the supplied one.
    pub pf_block_min_samples: u32,
    /// Regime edge (% per trade) at or below this hard-blocks entries.
    pub regime_block_edge_pct: f64,
    pub regime_block_min_samples: u32,
    /// In a blind-spot regime, entries below this confidence are blocked.
    pub blind_spot_min_confidence: f64,
}

impl Default for SizingParams {
    fn default() -> Self {
        Self {
            base_notional: 1_000.0,
            pf_strong: 1.5,
            pf_strong_factor: 1.2,
            pf_floor: 0.9,
            pf_weak_factor: 0.7,
            max_drawdown: 0.20,
            drawdown_min_factor: 0.3,
            edge_scale_pct: 0.5,
            vol_high_pct: 3.0,
            vol_min_factor: 0.5,
            confident_level: 0.80,
            confident_factor: 1.25,
            pf_block_floor: 0.5,
            pf_block_min_samples: 10,
            regime_block_edge_pct: -0.15,
            regime_block_min_samples: 20,
            blind_spot_min_confidence: 0.70,
        }
    }
}

// =============================================================================
// Data, ledger and runtime parameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataParams {
    /// Trailing bars fetched for each step.
    pub window_bars: usize,
    /// Maximum lag of the signal snapshot behind the current bar; 0 disables.
    pub max_signal_lag_ms: i64,
}

impl Default for DataParams {
    fn default() -> Self {
        Self {
            window_bars: 40,
            max_signal_lag_ms: 15 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerParams {
    /// |pct| below this on an sl/drop/decay close marks the trade a scratch.
    pub scratch_materiality_pct: f64,
    /// Records kept in the rolling guardrail history.
    pub history_limit: usize,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            scratch_materiality_pct: 0.10,
            history_limit: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveParams {
    /// How often the live loop steps every symbol.
    pub poll_interval_ms: u64,
    /// How often the config file is re-read.
    pub config_reload_secs: u64,
    /// Append-only live trade log.
    pub trade_log: PathBuf,
}

impl Default for LiveParams {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            config_reload_secs: 30,
            trade_log: PathBuf::from("logs/live_trades.jsonl"),
        }
    }
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_timeframe() -> String {
    "5m".to_string()
}

fn default_initial_equity() -> f64 {
    10_000.0
}

fn default_decision_log_capacity() -> usize {
    100
}

// =============================================================================
// EngineConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default)]
    pub regime: RegimeParams,
    #[serde(default)]
    pub aggregator: AggregatorParams,
    #[serde(default = "default_bucket_spec")]
    pub buckets: BTreeMap<Bucket, Vec<SignalWeight>>,
    #[serde(default = "default_regimes")]
    pub regimes: BTreeMap<Regime, RegimeProfile>,
    #[serde(default)]
    pub entry: EntryParams,
    #[serde(default)]
    pub risk_bands: RiskBandParams,
    #[serde(default)]
    pub sizing: SizingParams,
    #[serde(default)]
    pub data: DataParams,
    #[serde(default)]
    pub ledger: LedgerParams,
    #[serde(default)]
    pub live: LiveParams,
    #[serde(default = "default_initial_equity")]
    pub initial_equity: f64,
    #[serde(default = "default_decision_log_capacity")]
    pub decision_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframe: default_timeframe(),
            regime: RegimeParams::default(),
            aggregator: AggregatorParams::default(),
            buckets: default_bucket_spec(),
            regimes: default_regimes(),
            entry: EntryParams::default(),
            risk_bands: RiskBandParams::default(),
            sizing: SizingParams::default(),
            data: DataParams::default(),
            ledger: LedgerParams::default(),
            live: LiveParams::default(),
            initial_equity: default_initial_equity(),
            decision_log_capacity: default_decision_log_capacity(),
        }
    }
}

/// A value that was out of range and has been replaced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigIssue {
    pub field: String,
    pub problem: String,
}

struct Repair<'a> {
    issues: &'a mut Vec<ConfigIssue>,
}

impl Repair<'_> {
    fn note(&mut self, field: &str, problem: String) {
        self.issues.push(ConfigIssue {
            field: field.to_string(),
            problem,
        });
    }

    fn unit(&mut self, field: &str, value: &mut f64, default: f64) {
        if !value.is_finite() || !(0.0..=1.0).contains(value) {
            self.note(field, format!("{value} not in [0, 1], using {default}"));
            *value = default;
        }
    }

    fn positive(&mut self, field: &str, value: &mut f64, default: f64) {
        if !value.is_finite() || *value <= 0.0 {
            self.note(field, format!("{value} must be > 0, using {default}"));
            *value = default;
        }
    }

    fn finite(&mut self, field: &str, value: &mut f64, default: f64) {
        if !value.is_finite() {
            self.note(field, format!("{value} is not finite, using {default}"));
            *value = default;
        }
    }

    fn at_least<T: PartialOrd + Copy + std::fmt::Display>(
        &mut self,
        field: &str,
        value: &mut T,
        min: T,
        default: T,
    ) {
        if *value < min {
            self.note(field, format!("{value} below minimum {min}, using {default}"));
            *value = default;
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            timeframe = %config.timeframe,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Load and validate, falling back to defaults when the file is missing
    /// or unparseable.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let config = Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "failed to load engine config, using defaults");
            Self::default()
        });
        config.validated().0
    }

    /// Persist using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// SHA-256 of the canonical JSON encoding. Maps are ordered, so equal
    /// configs always hash equal.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn profile(&self, regime: Regime) -> &RegimeProfile {
        // `validated` guarantees every regime is present; the fallback covers
        // configs built by hand in tests.
        self.regimes
            .get(&regime)
            .unwrap_or_else(|| fallback_profile(regime))
    }

    /// Repair out-of-range values and return the issues found. Every repair
    /// is logged at `warn`.
    pub fn validated(mut self) -> (Self, Vec<ConfigIssue>) {
        let mut issues = Vec::new();
        let d = EngineConfig::default();
        {
            let mut r = Repair {
                issues: &mut issues,
            };

            // --- regime classifier --------------------------------------
            let rp = &mut self.regime;
            let drp = &d.regime;
            r.at_least("regime.window", &mut rp.window, 2, drp.window);
            r.at_least("regime.min_bars", &mut rp.min_bars, 2, drp.min_bars);
            r.at_least("regime.short_slope_bars", &mut rp.short_slope_bars, 2, drp.short_slope_bars);
            r.at_least("regime.atr_short_period", &mut rp.atr_short_period, 1, drp.atr_short_period);
            r.at_least("regime.atr_long_period", &mut rp.atr_long_period, 1, drp.atr_long_period);
            r.positive("regime.high_vol_atr_pct", &mut rp.high_vol_atr_pct, drp.high_vol_atr_pct);
            r.positive("regime.high_vol_atr_ratio", &mut rp.high_vol_atr_ratio, drp.high_vol_atr_ratio);
            r.positive("regime.trend_pct_change", &mut rp.trend_pct_change, drp.trend_pct_change);
            r.unit("regime.fallback_pct_fraction", &mut rp.fallback_pct_fraction, drp.fallback_pct_fraction);
            r.positive("regime.fallback_min_slope", &mut rp.fallback_min_slope, drp.fallback_min_slope);

            // --- aggregator ---------------------------------------------
            let ap = &mut self.aggregator;
            r.unit("aggregator.neutral_threshold", &mut ap.neutral_threshold, d.aggregator.neutral_threshold);
            r.unit("aggregator.bucket_deadband", &mut ap.bucket_deadband, d.aggregator.bucket_deadband);
            if ap.confidence_precision == 0 || ap.confidence_precision > 10 {
                r.note(
                    "aggregator.confidence_precision",
                    format!("{} not in 1..=10, using {}", ap.confidence_precision, d.aggregator.confidence_precision),
                );
                ap.confidence_precision = d.aggregator.confidence_precision;
            }

            // --- bucket map ---------------------------------------------
            for (bucket, entries) in self.buckets.iter_mut() {
                let before = entries.len();
                entries.retain(|e| !e.signal.trim().is_empty() && e.weight.is_finite());
                if entries.len() != before {
                    r.note(
                        &format!("buckets.{bucket}"),
                        format!("dropped {} entries with empty name or non-finite weight", before - entries.len()),
                    );
                }
                // First listing of a signal wins.
                let mut seen = BTreeSet::new();
                let mut duplicates = Vec::new();
                entries.retain(|e| {
                    let fresh = seen.insert(e.signal.clone());
                    if !fresh {
                        duplicates.push(e.signal.clone());
                    }
                    fresh
                });
                for signal in duplicates {
                    r.note(
                        &format!("buckets.{bucket}.{signal}"),
                        "listed twice, keeping the first entry".to_string(),
                    );
                }
            }
            self.buckets.retain(|_, entries| !entries.is_empty());
            if self.buckets.is_empty() {
                r.note("buckets", "no usable bucket entries, using default map".to_string());
                self.buckets = default_bucket_spec();
            }

            // --- regime profiles ----------------------------------------
            for regime in Regime::ALL {
                let field = format!("regimes.{regime}");
                let default_profile = RegimeProfile::default_for(regime);
                let profile = self.regimes.entry(regime).or_insert_with(|| {
                    r.note(&field, "missing profile, using default".to_string());
                    default_profile.clone()
                });

                if profile.entry_threshold.is_nan() {
                    r.note(
                        &format!("{field}.entry_threshold"),
                        format!("missing, using {}", default_profile.entry_threshold),
                    );
                    profile.entry_threshold = default_profile.entry_threshold;
                }
                r.unit(&format!("{field}.entry_threshold"), &mut profile.entry_threshold, default_profile.entry_threshold);

                let weights_ok = !profile.weights.is_empty()
                    && profile.weights.values().all(|w| w.is_finite() && *w >= 0.0)
                    && profile.weights.values().sum::<f64>() > 0.0;
                if !weights_ok {
                    let why = if profile.weights.is_empty() {
                        "missing weights, using default"
                    } else {
                        "negative, non-finite or zero-sum weights, using default"
                    };
                    r.note(&format!("{field}.weights"), why.to_string());
                    profile.weights = default_profile.weights.clone();
                }
                let total: f64 = profile.weights.values().sum();
                if (total - 1.0).abs() > 1e-9 {
                    for w in profile.weights.values_mut() {
                        *w /= total;
                    }
                }

                let e = &mut profile.exit;
                let de = &default_profile.exit;
                r.unit(&format!("{field}.exit.stop_loss_confidence"), &mut e.stop_loss_confidence, de.stop_loss_confidence);
                r.unit(&format!("{field}.exit.take_profit_confidence"), &mut e.take_profit_confidence, de.take_profit_confidence);
                r.unit(&format!("{field}.exit.take_profit_fast_confidence"), &mut e.take_profit_fast_confidence, de.take_profit_fast_confidence);
                r.unit(&format!("{field}.exit.exit_min_confidence"), &mut e.exit_min_confidence, de.exit_min_confidence);
                r.unit(&format!("{field}.exit.reverse_confidence"), &mut e.reverse_confidence, de.reverse_confidence);
                r.at_least(&format!("{field}.exit.decay_bars"), &mut e.decay_bars, 1, de.decay_bars);
                if e.take_profit_fast_confidence < e.take_profit_confidence {
                    r.note(
                        &format!("{field}.exit.take_profit_fast_confidence"),
                        format!("{} below take_profit_confidence, raised to it", e.take_profit_fast_confidence),
                    );
                    e.take_profit_fast_confidence = e.take_profit_confidence;
                }
                if e.reverse_confidence >= e.stop_loss_confidence {
                    // Not repaired: reverse is simply unreachable behind stop-loss.
                    warn!(regime = %regime, "reverse_confidence >= stop_loss_confidence; reverse exits can never fire");
                }
            }

            // --- entry / bands / sizing ---------------------------------
            let ep = &mut self.entry;
            r.unit("entry.threshold_floor", &mut ep.threshold_floor, d.entry.threshold_floor);
            r.unit("entry.threshold_ceiling", &mut ep.threshold_ceiling, d.entry.threshold_ceiling);
            if ep.threshold_floor > ep.threshold_ceiling {
                r.note("entry.threshold_floor", "floor above ceiling, using defaults for both".to_string());
                ep.threshold_floor = d.entry.threshold_floor;
                ep.threshold_ceiling = d.entry.threshold_ceiling;
            }
            r.at_least("entry.cooldown_secs", &mut ep.cooldown_secs, 0, d.entry.cooldown_secs);
            r.at_least("entry.loss_cluster_lookback_secs", &mut ep.loss_cluster_lookback_secs, 0, d.entry.loss_cluster_lookback_secs);

            let bp = &mut self.risk_bands;
            r.unit("risk_bands.elevated_drawdown", &mut bp.elevated_drawdown, d.risk_bands.elevated_drawdown);
            r.unit("risk_bands.defensive_drawdown", &mut bp.defensive_drawdown, d.risk_bands.defensive_drawdown);
            r.finite("risk_bands.elevated_adjustment", &mut bp.elevated_adjustment, d.risk_bands.elevated_adjustment);
            r.finite("risk_bands.defensive_adjustment", &mut bp.defensive_adjustment, d.risk_bands.defensive_adjustment);

            let sp = &mut self.sizing;
            let ds = &d.sizing;
            r.positive("sizing.base_notional", &mut sp.base_notional, ds.base_notional);
            r.positive("sizing.pf_strong", &mut sp.pf_strong, ds.pf_strong);
            r.positive("sizing.pf_strong_factor", &mut sp.pf_strong_factor, ds.pf_strong_factor);
            r.positive("sizing.pf_floor", &mut sp.pf_floor, ds.pf_floor);
            r.positive("sizing.pf_weak_factor", &mut sp.pf_weak_factor, ds.pf_weak_factor);
            r.positive("sizing.max_drawdown", &mut sp.max_drawdown, ds.max_drawdown);
            r.unit("sizing.drawdown_min_factor", &mut sp.drawdown_min_factor, ds.drawdown_min_factor);
            r.positive("sizing.edge_scale_pct", &mut sp.edge_scale_pct, ds.edge_scale_pct);
            r.positive("sizing.vol_high_pct", &mut sp.vol_high_pct, ds.vol_high_pct);
            r.unit("sizing.vol_min_factor", &mut sp.vol_min_factor, ds.vol_min_factor);
            r.unit("sizing.confident_level", &mut sp.confident_level, ds.confident_level);
            r.positive("sizing.confident_factor", &mut sp.confident_factor, ds.confident_factor);
            r.finite("sizing.pf_block_floor", &mut sp.pf_block_floor, ds.pf_block_floor);
            r.finite("sizing.regime_block_edge_pct", &mut sp.regime_block_edge_pct, ds.regime_block_edge_pct);
            r.unit("sizing.blind_spot_min_confidence", &mut sp.blind_spot_min_confidence, ds.blind_spot_min_confidence);

            // --- data / ledger / runtime --------------------------------
            r.at_least("data.window_bars", &mut self.data.window_bars, 2, d.data.window_bars);
            r.at_least("data.max_signal_lag_ms", &mut self.data.max_signal_lag_ms, 0, d.data.max_signal_lag_ms);
            r.finite("ledger.scratch_materiality_pct", &mut self.ledger.scratch_materiality_pct, d.ledger.scratch_materiality_pct);
            if self.ledger.scratch_materiality_pct < 0.0 {
                r.note("ledger.scratch_materiality_pct", "negative, using default".to_string());
                self.ledger.scratch_materiality_pct = d.ledger.scratch_materiality_pct;
            }
            r.at_least("ledger.history_limit", &mut self.ledger.history_limit, 1, d.ledger.history_limit);
            if self.live.poll_interval_ms == 0 {
                r.note("live.poll_interval_ms", format!("0 not allowed, using {}", d.live.poll_interval_ms));
                self.live.poll_interval_ms = d.live.poll_interval_ms;
            }
            r.positive("initial_equity", &mut self.initial_equity, d.initial_equity);
            r.at_least("decision_log_capacity", &mut self.decision_log_capacity, 1, d.decision_log_capacity);
        }

        for issue in &issues {
            warn!(field = %issue.field, problem = %issue.problem, "malformed config value repaired");
        }
        (self, issues)
    }
}

fn fallback_profile(regime: Regime) -> &'static RegimeProfile {
    static PROFILES: std::sync::OnceLock<BTreeMap<Regime, RegimeProfile>> = std::sync::OnceLock::new();
    let map = PROFILES.get_or_init(default_regimes);
    &map[&regime]
}

// =============================================================================
// ConfigHandle: hot reload
// =============================================================================

/// Shared, hot-reloadable configuration. Readers take an `Arc` snapshot and
/// keep it for the whole step.
pub struct ConfigHandle {
    current: RwLock<Arc<EngineConfig>>,
    version: AtomicU64,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config.validated().0)),
            version: AtomicU64::new(1),
            path: None,
        }
    }

    /// Load from `path` (defaults on failure) and remember it for `reload`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = EngineConfig::load_or_default(&path);
        Self {
            current: RwLock::new(Arc::new(config)),
            version: AtomicU64::new(1),
            path: Some(path),
        }
    }

    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Replace the configuration. Bumps the version only when it changed.
    pub fn replace(&self, config: EngineConfig) -> bool {
        let config = config.validated().0;
        let mut cur = self.current.write();
        if **cur == config {
            return false;
        }
        *cur = Arc::new(config);
        self.version.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Re-read the backing file. A file that fails to load leaves the current
    /// configuration untouched.
    pub fn reload(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let config = EngineConfig::load(path)?;
        let changed = self.replace(config);
        if changed {
            info!(path = %path.display(), version = self.version(), "engine config hot-reloaded");
        }
        Ok(changed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let (cfg, issues) = EngineConfig::default().validated();
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
        assert_eq!(cfg.regimes.len(), 4);
        for regime in Regime::ALL {
            let sum: f64 = cfg.profile(regime).weights.values().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["SOLUSDT"], "entry": { "cooldown_secs": 60 } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["SOLUSDT"]);
        assert_eq!(cfg.entry.cooldown_secs, 60);
        assert_eq!(cfg.entry.loss_cluster_count, 3);
        assert_eq!(cfg.regime, RegimeParams::default());
    }

    #[test]
    fn out_of_range_values_fall_back() {
        let mut cfg = EngineConfig::default();
        cfg.aggregator.neutral_threshold = 1.7;
        cfg.sizing.base_notional = -5.0;
        cfg.regimes.remove(&Regime::Chop);
        cfg.regimes
            .get_mut(&Regime::TrendUp)
            .unwrap()
            .weights
            .insert(Bucket::Flow, -1.0);

        let (fixed, issues) = cfg.validated();
        assert_eq!(fixed.aggregator.neutral_threshold, 0.10);
        assert_eq!(fixed.sizing.base_notional, 1_000.0);
        assert_eq!(fixed.profile(Regime::Chop), &RegimeProfile::default_for(Regime::Chop));
        assert_eq!(
            fixed.profile(Regime::TrendUp).weights,
            RegimeProfile::default_for(Regime::TrendUp).weights
        );
        assert!(issues.iter().any(|i| i.field == "aggregator.neutral_threshold"));
        assert!(issues.iter().any(|i| i.field == "regimes.chop"));
        assert!(issues.iter().any(|i| i.field == "regimes.trend_up.weights"));
    }

    #[test]
    fn partial_regime_profile_takes_regime_defaults() {
        let json = r#"{ "regimes": { "trend_up": { "weights": { "momentum": 1.0 } }, "chop": { "entry_threshold": 0.8 } } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        let (fixed, issues) = cfg.validated();

        let up = fixed.profile(Regime::TrendUp);
        assert_eq!(up.entry_threshold, RegimeProfile::default_for(Regime::TrendUp).entry_threshold);
        assert_eq!(up.weights.len(), 1);
        assert_eq!(up.weights[&Bucket::Momentum], 1.0);

        let chop = fixed.profile(Regime::Chop);
        assert_eq!(chop.entry_threshold, 0.8);
        assert_eq!(chop.weights, RegimeProfile::default_for(Regime::Chop).weights);

        assert!(issues.iter().any(|i| i.field == "regimes.trend_up.entry_threshold"));
        assert!(issues.iter().any(|i| i.field == "regimes.chop.weights"));
        assert!(crate::engine::DecisionEngine::new(Arc::new(fixed), crate::types::ReplayMode::Standard).is_ok());
    }

    #[test]
    fn duplicate_bucket_signal_keeps_first_entry() {
        let mut cfg = EngineConfig::default();
        cfg.buckets.insert(
            Bucket::Flow,
            vec![
                SignalWeight::new("cvd_delta", 0.7),
                SignalWeight::new("orderbook_imbalance", 0.3),
                SignalWeight::new("cvd_delta", 0.2),
            ],
        );
        assert!(crate::signals::BucketMap::new(&cfg.buckets).is_err());

        let (fixed, issues) = cfg.validated();
        let flow = &fixed.buckets[&Bucket::Flow];
        assert_eq!(flow.len(), 2);
        assert_eq!(flow[0].signal, "cvd_delta");
        assert_eq!(flow[0].weight, 0.7);
        assert!(issues.iter().any(|i| i.field == "buckets.flow.cvd_delta"));
        assert!(crate::engine::DecisionEngine::new(Arc::new(fixed), crate::types::ReplayMode::Standard).is_ok());
    }

    #[test]
    fn weights_are_renormalised() {
        let mut cfg = EngineConfig::default();
        let p = cfg.regimes.get_mut(&Regime::HighVol).unwrap();
        p.weights = [(Bucket::Flow, 2.0), (Bucket::Momentum, 2.0)].into_iter().collect();
        let (fixed, issues) = cfg.validated();
        assert!(issues.is_empty());
        assert_eq!(fixed.profile(Regime::HighVol).weights[&Bucket::Flow], 0.5);
    }

    #[test]
    fn fast_take_profit_is_raised_to_take_profit() {
        let mut cfg = EngineConfig::default();
        let e = &mut cfg.regimes.get_mut(&Regime::TrendUp).unwrap().exit;
        e.take_profit_confidence = 0.85;
        e.take_profit_fast_confidence = 0.70;
        let (fixed, _) = cfg.validated();
        assert_eq!(fixed.profile(Regime::TrendUp).exit.take_profit_fast_confidence, 0.85);
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = EngineConfig::default();
        let mut b = EngineConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.entry.cooldown_secs += 1;
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn save_and_hot_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        EngineConfig::default().save(&path).unwrap();

        let handle = ConfigHandle::from_path(&path);
        assert_eq!(handle.version(), 1);
        assert!(!handle.reload().unwrap());

        let mut changed = EngineConfig::default();
        changed.entry.cooldown_secs = 42;
        changed.save(&path).unwrap();
        assert!(handle.reload().unwrap());
        assert_eq!(handle.version(), 2);
        assert_eq!(handle.snapshot().entry.cooldown_secs, 42);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot().entry.cooldown_secs, 42);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = EngineConfig::load_or_default("/definitely/not/here.json");
        assert_eq!(cfg, EngineConfig::default());
    }
}
