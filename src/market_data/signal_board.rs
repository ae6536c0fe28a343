// =============================================================================
// Signal vectors and the live signal board
// =============================================================================
//
// Signals are computed elsewhere. This module only carries them: an ordered
// list of normalised values in [-1, 1] (keyed by name) plus a registry of the
// raw, un-normalised readings for traceability.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::market_data::BarKey;

/// Normalised signal snapshot for one `(symbol, timeframe)` at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalVector {
    /// Signal names, index-aligned with `values`.
    pub names: Vec<String>,
    /// Normalised values, expected in `[-1, 1]`.
    pub values: Vec<f64>,
    /// Raw readings by name (funding rate in bps, RSI level, ...).
    #[serde(default)]
    pub raw: BTreeMap<String, f64>,
}

impl SignalVector {
    /// Build from `(name, normalised value)` pairs, keeping their order.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (name, value) in pairs {
            names.push(name.into());
            values.push(value);
        }
        Self {
            names,
            values,
            raw: BTreeMap::new(),
        }
    }

    pub fn with_raw(mut self, name: impl Into<String>, value: f64) -> Self {
        self.raw.insert(name.into(), value);
        self
    }

    /// Normalised value for `name`, clamped to `[-1, 1]`. Non-finite values
    /// read as absent.
    pub fn value(&self, name: &str) -> Option<f64> {
        let idx = self.names.iter().position(|n| n == name)?;
        let v = *self.values.get(idx)?;
        v.is_finite().then(|| v.clamp(-1.0, 1.0))
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Structural check performed before a step uses the vector.
    pub fn validate(&self) -> EngineResult<()> {
        if self.names.len() != self.values.len() {
            return Err(EngineError::DataUnavailable(format!(
                "signal vector has {} names but {} values",
                self.names.len(),
                self.values.len()
            )));
        }
        if self.is_empty() {
            return Err(EngineError::DataUnavailable(
                "signal vector is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timestamped signal vector as published by the signal collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub timestamp: i64,
    pub vector: SignalVector,
}

/// Latest signal snapshot per `(symbol, timeframe)`, written by the ingest
/// task and read by the live feed.
#[derive(Default)]
pub struct SignalBoard {
    latest: RwLock<HashMap<BarKey, SignalSnapshot>>,
}

impl SignalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot. Older snapshots never overwrite newer ones.
    pub fn publish(&self, key: BarKey, snapshot: SignalSnapshot) {
        let mut map = self.latest.write();
        match map.get(&key) {
            Some(existing) if existing.timestamp > snapshot.timestamp => {}
            _ => {
                map.insert(key, snapshot);
            }
        }
    }

    /// Newest snapshot whose timestamp is `<= at`.
    pub fn at_or_before(&self, key: &BarKey, at: i64) -> Option<SignalSnapshot> {
        self.latest
            .read()
            .get(key)
            .filter(|s| s.timestamp <= at)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_clamps_and_skips_non_finite() {
        let sv = SignalVector::from_pairs([("a", 1.7), ("b", f64::NAN), ("c", -0.3)]);
        assert_eq!(sv.value("a"), Some(1.0));
        assert_eq!(sv.value("b"), None);
        assert_eq!(sv.value("c"), Some(-0.3));
        assert_eq!(sv.value("missing"), None);
    }

    #[test]
    fn validate_rejects_misaligned_vector() {
        let mut sv = SignalVector::from_pairs([("a", 0.1)]);
        sv.values.push(0.2);
        assert!(matches!(sv.validate(), Err(EngineError::DataUnavailable(_))));
        assert!(SignalVector::default().validate().is_err());
    }

    #[test]
    fn board_keeps_newest_snapshot() {
        let board = SignalBoard::new();
        let key = BarKey::new("ETHUSDT", "5m");
        let snap = |ts: i64, v: f64| SignalSnapshot {
            timestamp: ts,
            vector: SignalVector::from_pairs([("m", v)]),
        };
        board.publish(key.clone(), snap(200, 0.5));
        board.publish(key.clone(), snap(100, -0.5));
        let got = board.at_or_before(&key, 500).unwrap();
        assert_eq!(got.timestamp, 200);
        assert!(board.at_or_before(&key, 150).is_none());
    }
}
