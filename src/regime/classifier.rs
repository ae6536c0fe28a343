// =============================================================================
// Regime Classifier
// =============================================================================
//
// Classifies a trailing window of bars into one of four regimes. Pure
// function of (bars, params); never errors.
//
// Decision order (evaluated top-to-bottom; first match wins):
//
//   1. HIGH_VOL: ATR% > high_vol_atr_pct OR ATR(short)/ATR(long) > ratio
//   2. TREND_UP: pct_change >= trend_pct_change, medium slope > 0, HH > LL
//      TREND_DOWN: pct_change <= -trend_pct_change, medium slope < 0, LL > HH
//   3. Fallback: |pct_change| >= trend_pct_change * fallback_pct_fraction,
//      short and medium slope agree, |medium slope| >= minimum
//   4. CHOP: default, and the answer for degenerate input
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::indicators::atr::{atr_pct, wilder_atr};
use crate::indicators::slope::normalized_slope;
use crate::market_data::Bar;
use crate::runtime_config::RegimeParams;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    TrendUp,
    TrendDown,
    HighVol,
    Chop,
}

impl Regime {
    pub const ALL: [Regime; 4] = [Regime::TrendUp, Regime::TrendDown, Regime::HighVol, Regime::Chop];
}

impl Default for Regime {
    fn default() -> Self {
        Regime::Chop
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendUp => write!(f, "trend_up"),
            Self::TrendDown => write!(f, "trend_down"),
            Self::HighVol => write!(f, "high_vol"),
            Self::Chop => write!(f, "chop"),
        }
    }
}

/// Every number the classifier looked at. Non-finite inputs are reported as
/// neutral values (0 for slopes and changes, 1 for the ATR ratio).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeMetrics {
    /// Slope of the last `short_slope_bars` closes, % of mean per bar.
    pub slope_short: f64,
    /// Slope of the whole window, % of mean per bar.
    pub slope_medium: f64,
    pub higher_highs: u32,
    pub lower_lows: u32,
    /// Long-period ATR as % of the last close.
    pub atr_pct: f64,
    /// Short-period ATR divided by long-period ATR.
    pub atr_ratio: f64,
    /// Percent change from the first to the last close of the window.
    pub pct_change: f64,
    pub bars_used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeResult {
    pub regime: Regime,
    pub metrics: RegimeMetrics,
}

impl RegimeResult {
    fn chop(metrics: RegimeMetrics) -> Self {
        Self {
            regime: Regime::Chop,
            metrics,
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Classify the trailing `params.window` bars of `bars` (oldest first). Uses
/// fewer bars when fewer are available.
pub fn classify(bars: &[Bar], params: &RegimeParams) -> RegimeResult {
    let n = bars.len().min(params.window.max(2));
    let window = &bars[bars.len() - n..];

    let mut metrics = RegimeMetrics {
        atr_ratio: 1.0,
        bars_used: n,
        ..RegimeMetrics::default()
    };

    if n < params.min_bars.max(2) || window.iter().any(|b| !b.is_valid()) {
        return RegimeResult::chop(metrics);
    }

    let closes: Vec<f64> = window.iter().map(|b| b.close).collect();

    // --- Slopes ---------------------------------------------------------------
    let short_len = params.short_slope_bars.clamp(2, n);
    metrics.slope_short = normalized_slope(&closes[n - short_len..]).unwrap_or(0.0);
    metrics.slope_medium = normalized_slope(&closes).unwrap_or(0.0);

    // --- Higher highs / lower lows -------------------------------------------
    for pair in window.windows(2) {
        if pair[1].high > pair[0].high {
            metrics.higher_highs += 1;
        }
        if pair[1].low < pair[0].low {
            metrics.lower_lows += 1;
        }
    }

    // --- Volatility -----------------------------------------------------------
    // Long period is capped to what the window can support.
    let long_period = params.atr_long_period.min(n - 1).max(1);
    let short_period = params.atr_short_period.min(long_period).max(1);
    metrics.atr_pct = atr_pct(window, long_period).unwrap_or(0.0);
    let atr_long = wilder_atr(window, long_period).unwrap_or(0.0);
    let atr_short = wilder_atr(&window[n - (short_period + 1)..], short_period).unwrap_or(0.0);
    if atr_long > 0.0 {
        let ratio = atr_short / atr_long;
        metrics.atr_ratio = if ratio.is_finite() { ratio } else { 1.0 };
    }

    // --- Percent change -------------------------------------------------------
    let first = closes[0];
    let last = closes[n - 1];
    let pct = (last - first) / first * 100.0;
    metrics.pct_change = if pct.is_finite() { pct } else { 0.0 };

    let regime = decide(&metrics, params);

    trace!(
        regime = %regime,
        slope_short = metrics.slope_short,
        slope_medium = metrics.slope_medium,
        hh = metrics.higher_highs,
        ll = metrics.lower_lows,
        atr_pct = metrics.atr_pct,
        atr_ratio = metrics.atr_ratio,
        pct_change = metrics.pct_change,
        "regime classified"
    );

    RegimeResult { regime, metrics }
}

fn decide(m: &RegimeMetrics, p: &RegimeParams) -> Regime {
    // 1. High volatility
    if m.atr_pct > p.high_vol_atr_pct || m.atr_ratio > p.high_vol_atr_ratio {
        return Regime::HighVol;
    }

    // 2. Confirmed trend
    if m.pct_change >= p.trend_pct_change && m.slope_medium > 0.0 && m.higher_highs > m.lower_lows {
        return Regime::TrendUp;
    }
    if m.pct_change <= -p.trend_pct_change && m.slope_medium < 0.0 && m.lower_lows > m.higher_highs {
        return Regime::TrendDown;
    }

    // 3. Slope-confirmed move below the percent-change cut-off
    let fallback_pct = p.trend_pct_change * p.fallback_pct_fraction;
    if m.pct_change.abs() >= fallback_pct && m.slope_medium.abs() >= p.fallback_min_slope {
        let same_sign = m.slope_short.signum() == m.slope_medium.signum() && m.slope_short != 0.0;
        if same_sign && m.slope_medium.signum() == m.pct_change.signum() {
            return if m.slope_medium > 0.0 {
                Regime::TrendUp
            } else {
                Regime::TrendDown
            };
        }
    }

    Regime::Chop
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn series(closes: &[f64], half_range: f64) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: i as i64 * 60_000,
                open: c,
                high: c + half_range,
                low: c - half_range,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    fn linear(start: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn too_few_bars_is_chop() {
        let bars = series(&[100.0, 101.0, 102.0], 0.1);
        let r = classify(&bars, &RegimeParams::default());
        assert_eq!(r.regime, Regime::Chop);
        assert_eq!(r.metrics.bars_used, 3);
        assert!(classify(&[], &RegimeParams::default()).regime == Regime::Chop);
    }

    #[test]
    fn flat_prices_are_chop() {
        let bars = series(&[100.0; 30], 0.0);
        let r = classify(&bars, &RegimeParams::default());
        assert_eq!(r.regime, Regime::Chop);
        assert_eq!(r.metrics.atr_pct, 0.0);
        assert_eq!(r.metrics.atr_ratio, 1.0);
    }

    #[test]
    fn steady_rise_is_trend_up() {
        let bars = series(&linear(100.0, 0.2, 20), 0.2);
        let r = classify(&bars, &RegimeParams::default());
        assert_eq!(r.regime, Regime::TrendUp);
        assert!(r.metrics.pct_change > 3.0);
        assert_eq!(r.metrics.higher_highs, 19);
    }

    #[test]
    fn steady_fall_is_trend_down() {
        let bars = series(&linear(100.0, -0.2, 20), 0.2);
        assert_eq!(classify(&bars, &RegimeParams::default()).regime, Regime::TrendDown);
    }

    #[test]
    fn fallback_catches_slope_confirmed_drift() {
        // ~1.1 % over the window: below 1.5 but above the 0.75 fallback.
        let bars = series(&linear(100.0, 0.06, 20), 0.05);
        let r = classify(&bars, &RegimeParams::default());
        assert!(r.metrics.pct_change < 1.5);
        assert_eq!(r.regime, Regime::TrendUp);
    }

    #[test]
    fn wide_ranges_are_high_vol_even_when_trending() {
        let bars = series(&linear(100.0, 0.5, 20), 5.0);
        let r = classify(&bars, &RegimeParams::default());
        assert!(r.metrics.atr_pct > 3.5);
        assert_eq!(r.regime, Regime::HighVol);
    }

    #[test]
    fn oscillation_is_chop() {
        let closes: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 100.0 } else { 100.4 }).collect();
        assert_eq!(classify(&series(&closes, 0.2), &RegimeParams::default()).regime, Regime::Chop);
    }

    #[test]
    fn only_trailing_window_is_used() {
        // A long decline followed by 20 rising bars classifies on the rise.
        let mut closes = linear(150.0, -1.0, 50);
        closes.extend(linear(100.0, 0.2, 20));
        let r = classify(&series(&closes, 0.2), &RegimeParams::default());
        assert_eq!(r.metrics.bars_used, 20);
        assert_eq!(r.regime, Regime::TrendUp);
    }

    #[test]
    fn invalid_bar_in_window_is_chop() {
        let mut bars = series(&linear(100.0, 0.2, 20), 0.2);
        bars[10].close = f64::NAN;
        assert_eq!(classify(&bars, &RegimeParams::default()).regime, Regime::Chop);
    }

    proptest! {
        #[test]
        fn classification_is_total_and_deterministic(
            closes in prop::collection::vec(1.0f64..100_000.0, 0..60),
            half_range in 0.0f64..0.9,
        ) {
            let bars = series(&closes, half_range);
            let params = RegimeParams::default();
            let a = classify(&bars, &params);
            let b = classify(&bars, &params);
            prop_assert!(Regime::ALL.contains(&a.regime));
            prop_assert_eq!(a, b);
        }
    }
}
