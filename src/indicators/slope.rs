// =============================================================================
// Least-squares slope of a close series
// =============================================================================
//
// Slope is expressed as percent of the mean close per bar so that windows on
// differently priced assets compare directly.

/// Ordinary least-squares slope of `values` against their index, divided by
/// the mean and scaled to percent. `None` for fewer than two points, a
/// non-positive mean, or non-finite input.
pub fn normalized_slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 || values.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / nf;
    if mean_y <= 0.0 {
        return None;
    }

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        return None;
    }

    let slope = num / den / mean_y * 100.0;
    slope.is_finite().then_some(slope)
}
