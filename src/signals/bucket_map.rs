// =============================================================================
// Bucket Map: validated static signal → bucket table
// =============================================================================
//
// Raw signals are grouped into seven semantic buckets. The mapping is a typed
// table built once from configuration; lookups never dispatch on strings
// beyond reading a named value from the signal vector.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::runtime_config::SignalWeight;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Momentum,
    MeanReversion,
    Flow,
    Positioning,
    Timing,
    Sentiment,
    OnchainFlow,
}

impl Bucket {
    /// Fixed iteration order used wherever buckets are summed.
    pub const ALL: [Bucket; 7] = [
        Bucket::Momentum,
        Bucket::MeanReversion,
        Bucket::Flow,
        Bucket::Positioning,
        Bucket::Timing,
        Bucket::Sentiment,
        Bucket::OnchainFlow,
    ];
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Momentum => "momentum",
            Self::MeanReversion => "mean_reversion",
            Self::Flow => "flow",
            Self::Positioning => "positioning",
            Self::Timing => "timing",
            Self::Sentiment => "sentiment",
            Self::OnchainFlow => "onchain_flow",
        };
        f.write_str(s)
    }
}

/// A signal may appear in several buckets; each entry is independent.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketMap {
    entries: BTreeMap<Bucket, Vec<SignalWeight>>,
}

impl BucketMap {
    /// Build from a configuration table. Rejects empty tables, blank signal
    /// names, non-finite weights and duplicate signals within one bucket.
    pub fn new(spec: &BTreeMap<Bucket, Vec<SignalWeight>>) -> EngineResult<Self> {
        if spec.values().all(|v| v.is_empty()) {
            return Err(EngineError::Config("bucket map has no entries".into()));
        }
        for (bucket, entries) in spec {
            let mut seen = std::collections::BTreeSet::new();
            for e in entries {
                if e.signal.trim().is_empty() {
                    return Err(EngineError::Config(format!("{bucket}: blank signal name")));
                }
                if !e.weight.is_finite() {
                    return Err(EngineError::Config(format!(
                        "{bucket}.{}: non-finite weight",
                        e.signal
                    )));
                }
                if !seen.insert(e.signal.as_str()) {
                    return Err(EngineError::Config(format!(
                        "{bucket}.{}: listed twice",
                        e.signal
                    )));
                }
            }
        }
        Ok(Self {
            entries: spec.clone(),
        })
    }

    pub fn entries(&self, bucket: Bucket) -> &[SignalWeight] {
        self.entries.get(&bucket).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Buckets that have at least one signal, in `Bucket::ALL` order.
    pub fn populated(&self) -> impl Iterator<Item = Bucket> + '_ {
        Bucket::ALL.into_iter().filter(|b| !self.entries(*b).is_empty())
    }

    /// Every signal name referenced by the table, deduplicated and sorted.
    pub fn signal_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .values()
            .flatten()
            .map(|e| e.signal.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::default_bucket_spec;

    #[test]
    fn default_table_is_valid_and_covers_every_bucket() {
        let map = BucketMap::new(&default_bucket_spec()).unwrap();
        assert_eq!(map.populated().count(), Bucket::ALL.len());
        assert!(map.signal_names().contains(&"funding_rate"));
    }

    #[test]
    fn rejects_bad_tables() {
        assert!(BucketMap::new(&BTreeMap::new()).is_err());

        let mut spec = BTreeMap::new();
        spec.insert(Bucket::Flow, vec![SignalWeight::new("cvd", f64::NAN)]);
        assert!(matches!(BucketMap::new(&spec), Err(EngineError::Config(_))));

        spec.insert(
            Bucket::Flow,
            vec![SignalWeight::new("cvd", 0.5), SignalWeight::new("cvd", 0.5)],
        );
        assert!(BucketMap::new(&spec).is_err());
    }

    #[test]
    fn signal_may_feed_several_buckets() {
        let mut spec = BTreeMap::new();
        spec.insert(Bucket::Flow, vec![SignalWeight::new("cvd", 1.0)]);
        spec.insert(Bucket::Momentum, vec![SignalWeight::new("cvd", 0.5)]);
        let map = BucketMap::new(&spec).unwrap();
        assert_eq!(map.signal_names(), vec!["cvd"]);
        assert_eq!(map.entries(Bucket::Momentum)[0].weight, 0.5);
        assert!(map.entries(Bucket::Timing).is_empty());
    }

    #[test]
    fn display_matches_serde_names() {
        for b in Bucket::ALL {
            let json = serde_json::to_string(&b).unwrap();
            assert_eq!(json, format!("\"{b}\""));
        }
    }
}
