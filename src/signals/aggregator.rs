// =============================================================================
// Bucket Confidence Aggregator: Regime-aware signal aggregation
// =============================================================================
//
// Per bucket:
//   score      = Σ(weight · signal)          over signals present in the vector
//   direction  = sign(score)                 when |score| > bucket_deadband
//   confidence = clamp(|score|, 0, 1)
//
// Across buckets (regime weight vector, optional regime mask):
//   final_score      = Σ(w_i · dir_i · conf_i) / Σ(w_i used)
//   final_direction  = sign(final_score)
//   final_confidence = clamp(|final_score|, 0, 1)
//
// The neutral zone is applied once, after all weighting. Every score and
// confidence is rounded to `confidence_precision` decimals, and buckets are
// always visited in `Bucket::ALL` order, so the output is a pure function of
// (signal vector, regime, config).
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineResult;
use crate::market_data::SignalVector;
use crate::regime::Regime;
use crate::runtime_config::{AggregatorParams, EngineConfig};
use crate::signals::{Bucket, BucketMap};
use crate::types::{round_to, Direction};

/// The result for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketScore {
    pub bucket: Bucket,
    pub score: f64,
    pub direction: Direction,
    pub confidence: f64,
    /// Regime weight applied to this bucket (0 when masked).
    pub weight: f64,
    pub masked: bool,
    /// How many mapped signals were present in the vector.
    pub signals_used: u32,
}

/// Output of one aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub final_direction: Direction,
    pub final_confidence: f64,
    pub final_score: f64,
    pub bucket_breakdown: Vec<BucketScore>,
    pub regime: Regime,
    /// True when the neutral zone zeroed direction and confidence.
    pub neutral_forced: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct RegimeWeights {
    weights: BTreeMap<Bucket, f64>,
    mask: BTreeSet<Bucket>,
}

/// Immutable aggregator built from one configuration snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregator {
    map: BucketMap,
    params: AggregatorParams,
    regimes: BTreeMap<Regime, RegimeWeights>,
}

impl Aggregator {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let map = BucketMap::new(&config.buckets)?;
        let regimes = Regime::ALL
            .iter()
            .map(|r| {
                let p = config.profile(*r);
                (
                    *r,
                    RegimeWeights {
                        weights: p.weights.clone(),
                        mask: p.mask.clone(),
                    },
                )
            })
            .collect();
        Ok(Self {
            map,
            params: config.aggregator.clone(),
            regimes,
        })
    }

    pub fn aggregate(&self, signals: &SignalVector, regime: Regime) -> Decision {
        let precision = self.params.confidence_precision;
        let rw = self.regimes.get(&regime);

        let mut breakdown = Vec::with_capacity(Bucket::ALL.len());
        let mut weighted_sum = 0.0;
        let mut weight_used = 0.0;

        for bucket in Bucket::ALL {
            let mut score = 0.0;
            let mut used = 0u32;
            for entry in self.map.entries(bucket) {
                if let Some(v) = signals.value(&entry.signal) {
                    score += entry.weight * v;
                    used += 1;
                }
            }
            let score = round_to(score, precision);
            let direction = Direction::from_score(score, self.params.bucket_deadband);
            let confidence = round_to(score.abs().clamp(0.0, 1.0), precision);

            let masked = rw.map(|w| w.mask.contains(&bucket)).unwrap_or(false);
            let weight = if masked {
                0.0
            } else {
                rw.and_then(|w| w.weights.get(&bucket)).copied().unwrap_or(0.0)
            };

            // Buckets with no present signals carry no information and do not
            // dilute the denominator.
            if used > 0 && weight > 0.0 {
                weighted_sum += weight * direction.as_f64() * confidence;
                weight_used += weight;
            }

            breakdown.push(BucketScore {
                bucket,
                score,
                direction,
                confidence,
                weight,
                masked,
                signals_used: used,
            });
        }

        let raw_final = if weight_used > 0.0 {
            weighted_sum / weight_used
        } else {
            0.0
        };
        let final_score = round_to(raw_final, precision);

        // Neutral zone: the single place direction/confidence are forced to 0.
        let neutral_forced = final_score.abs() < self.params.neutral_threshold;
        let (final_direction, final_confidence) = if neutral_forced {
            (Direction::Flat, 0.0)
        } else {
            (
                Direction::from_score(final_score, 0.0),
                round_to(final_score.abs().clamp(0.0, 1.0), precision),
            )
        };

        debug!(
            regime = %regime,
            final_score,
            final_direction = %final_direction,
            final_confidence,
            neutral_forced,
            "signals aggregated"
        );

        Decision {
            final_direction,
            final_confidence,
            final_score,
            bucket_breakdown: breakdown,
            regime,
            neutral_forced,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn agg() -> Aggregator {
        Aggregator::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn weights_only_buckets_with_signals() {
        let v = SignalVector::from_pairs([
            ("ema_cross", 0.8),
            ("orderbook_imbalance", 0.6),
            ("cvd_delta", 0.4),
        ]);
        let d = agg().aggregate(&v, Regime::TrendUp);
        // momentum 0.4*0.8 = 0.32, flow 0.5*0.6 + 0.5*0.4 = 0.5
        // (0.30*0.32 + 0.20*0.5) / (0.30 + 0.20) = 0.392
        assert_eq!(d.final_score, 0.392);
        assert_eq!(d.final_confidence, 0.392);
        assert_eq!(d.final_direction, Direction::Long);
        assert!(!d.neutral_forced);

        let momentum = &d.bucket_breakdown[0];
        assert_eq!(momentum.bucket, Bucket::Momentum);
        assert_eq!(momentum.score, 0.32);
        assert_eq!(momentum.signals_used, 1);
    }

    #[test]
    fn neutral_zone_forces_flat() {
        let v = SignalVector::from_pairs([("ema_cross", 0.15)]);
        // momentum score 0.06 > deadband 0.05, final 0.06 < neutral 0.10
        let d = agg().aggregate(&v, Regime::TrendUp);
        assert!(d.neutral_forced);
        assert_eq!(d.final_direction, Direction::Flat);
        assert_eq!(d.final_confidence, 0.0);
        assert_eq!(d.final_score, 0.06);
    }

    #[test]
    fn bucket_deadband_zeroes_direction() {
        let v = SignalVector::from_pairs([("session_bias", 0.04), ("fear_greed", -1.0)]);
        let d = agg().aggregate(&v, Regime::TrendDown);
        let timing = d.bucket_breakdown.iter().find(|b| b.bucket == Bucket::Timing).unwrap();
        assert_eq!(timing.direction, Direction::Flat);
        // timing contributes 0 but its weight still counts:
        // (0.10*0 + 0.10*(-1)*0.6) / 0.20 = -0.3
        assert_eq!(d.final_score, -0.3);
        assert_eq!(d.final_direction, Direction::Short);
    }

    #[test]
    fn mask_removes_bucket_from_regime() {
        // Chop masks momentum; only momentum has signals, so nothing is used.
        let v = SignalVector::from_pairs([("ema_cross", 1.0), ("roc_10", 1.0)]);
        let d = agg().aggregate(&v, Regime::Chop);
        assert_eq!(d.final_score, 0.0);
        assert_eq!(d.final_direction, Direction::Flat);
        assert!(d.bucket_breakdown[0].masked);
        assert_eq!(d.bucket_breakdown[0].weight, 0.0);

        let up = agg().aggregate(&v, Regime::TrendUp);
        assert_eq!(up.final_direction, Direction::Long);
    }

    #[test]
    fn out_of_range_signals_are_clamped() {
        let v = SignalVector::from_pairs([("session_bias", 7.0)]);
        let d = agg().aggregate(&v, Regime::TrendUp);
        assert_eq!(d.final_confidence, 1.0);
    }

    #[test]
    fn empty_vector_is_neutral() {
        let d = agg().aggregate(&SignalVector::default(), Regime::HighVol);
        assert!(d.neutral_forced);
        assert_eq!(d.bucket_breakdown.len(), Bucket::ALL.len());
    }

    proptest! {
        #[test]
        fn aggregation_is_deterministic_and_bounded(
            values in prop::collection::vec(-3.0f64..3.0, 17),
            regime_idx in 0usize..4,
        ) {
            let names = [
                "ema_cross", "roc_10", "macd_hist", "rsi_14", "bb_zscore",
                "orderbook_imbalance", "cvd_delta", "funding_rate",
                "open_interest_change", "long_short_ratio", "session_bias",
                "fear_greed", "news_tone", "exchange_netflow", "whale_transfers",
                "unmapped_a", "unmapped_b",
            ];
            let v = SignalVector::from_pairs(names.iter().copied().zip(values.iter().copied()));
            let regime = Regime::ALL[regime_idx];
            let a = agg();
            let d1 = a.aggregate(&v, regime);
            let d2 = agg().aggregate(&v.clone(), regime);
            prop_assert_eq!(&d1, &d2);
            prop_assert!((0.0..=1.0).contains(&d1.final_confidence));
            if d1.neutral_forced {
                prop_assert_eq!(d1.final_direction, Direction::Flat);
                prop_assert_eq!(d1.final_confidence, 0.0);
            } else {
                prop_assert!(d1.final_confidence >= 0.10);
            }
        }
    }
}
