// =============================================================================
// Average True Range (ATR): Wilder's Smoothing Method
// =============================================================================
//
//   TR_t  = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = SMA of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::Bar;

/// True range of every bar after the first, oldest first. NaN when any price
/// involved is non-finite (`f64::max` would otherwise drop the NaN).
pub fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            if ![cur.high, cur.low, prev.close].iter().all(|p| p.is_finite()) {
                return f64::NAN;
            }
            let hl = cur.high - cur.low;
            let hc = (cur.high - prev.close).abs();
            let lc = (cur.low - prev.close).abs();
            hl.max(hc).max(lc)
        })
        .collect()
}

/// Most recent Wilder ATR over `bars` (oldest first).
///
/// `None` when `period` is zero, when fewer than `period + 1` bars are
/// supplied, or when any intermediate value is non-finite.
pub fn wilder_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let tr = true_ranges(bars);
    let seed = tr[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let p = period as f64;
    let mut atr = seed;
    for &value in &tr[period..] {
        atr = (atr * (p - 1.0) + value) / p;
        if !atr.is_finite() {
            return None;
        }
    }
    Some(atr)
}

/// ATR as a percentage of the last close.
pub fn atr_pct(bars: &[Bar], period: usize) -> Option<f64> {
    let atr = wilder_atr(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some(atr / last_close * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: 0,
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn period_zero_or_short_input_is_none() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(wilder_atr(&bars, 0).is_none());
        assert!(wilder_atr(&bars, 14).is_none());
    }

    #[test]
    fn exact_minimum_data() {
        let bars = vec![
            bar(100.0, 102.0, 98.0, 101.0),
            bar(101.0, 104.0, 99.0, 103.0),
            bar(103.0, 106.0, 100.0, 105.0),
            bar(105.0, 108.0, 102.0, 107.0),
        ];
        let atr = wilder_atr(&bars, 3).unwrap();
        assert!(atr > 0.0 && atr.is_finite());
    }

    #[test]
    fn constant_range_converges() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let atr = wilder_atr(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn gap_uses_previous_close() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0),
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        assert_eq!(true_ranges(&bars)[0], 20.0);
        assert!(wilder_atr(&bars, 3).unwrap() > 7.0);
    }

    #[test]
    fn flat_prices_have_zero_atr() {
        let bars = vec![bar(100.0, 100.0, 100.0, 100.0); 20];
        assert_eq!(wilder_atr(&bars, 14), Some(0.0));
        assert_eq!(atr_pct(&bars, 14), Some(0.0));
    }

    #[test]
    fn nan_returns_none() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(wilder_atr(&bars, 3).is_none());
    }

    #[test]
    fn non_finite_price_poisons_true_range() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, f64::NAN, 100.0),
            bar(100.0, f64::INFINITY, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        let tr = true_ranges(&bars);
        assert!(tr[0].is_nan());
        assert!(tr[1].is_nan());
        assert_eq!(tr[2], 10.0);
        assert!(atr_pct(&bars, 2).is_none());
    }
}
