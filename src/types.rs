// =============================================================================
// Shared types used across the decision core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Directional stance of a signal, a decision, or an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Short,
    Flat,
    Long,
}

impl Direction {
    /// Sign of `value`, with anything inside `[-deadband, deadband]` mapped to
    /// `Flat`. Non-finite input is always `Flat`.
    pub fn from_score(value: f64, deadband: f64) -> Self {
        if !value.is_finite() || value.abs() <= deadband {
            Self::Flat
        } else if value > 0.0 {
            Self::Long
        } else {
            Self::Short
        }
    }

    /// `+1.0`, `0.0` or `-1.0`.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Flat => 0.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Flat => Self::Flat,
            Self::Short => Self::Long,
        }
    }

    pub fn is_flat(self) -> bool {
        self == Self::Flat
    }

    /// True when both sides are non-flat and point in opposite directions.
    pub fn opposes(self, other: Self) -> bool {
        !self.is_flat() && !other.is_flat() && self != other
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Flat
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Flat => write!(f, "flat"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// How a replay is allowed to widen entry rules.
///
/// `Standard` is the only mode the live runner ever constructs. `Analytical`
/// lets an offline replay open positions in every regime so that edge can be
/// measured where the live allow-list would stay flat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    Standard,
    Analytical,
}

impl Default for ReplayMode {
    fn default() -> Self {
        Self::Standard
    }
}

impl std::fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Analytical => write!(f, "analytical"),
        }
    }
}

impl std::str::FromStr for ReplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "" => Ok(Self::Standard),
            "analytical" => Ok(Self::Analytical),
            other => Err(format!("unknown replay mode '{other}'")),
        }
    }
}

/// Round to `decimals` places. Used wherever a value must be reproducible
/// bit-for-bit across call sites.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(decimals.min(12) as i32);
    (value * factor).round() / factor
}
