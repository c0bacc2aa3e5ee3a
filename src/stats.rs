//! Sample reductions used by the latency probe and the throughput engine.

/// Round `value` to `decimals` decimal places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Arithmetic mean, optionally rounded. `None` for an empty series.
pub fn average(values: &[f64], decimals: Option<u32>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;

    Some(decimals.map_or(mean, |d| round_to(mean, d)))
}

/// Interquartile mean: the average of the middle half of the sorted
/// series, indices `floor(n * 0.25)..ceil(n * 0.75)`.
pub fn interquartile_mean(values: &[f64], decimals: Option<u32>) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len() as f64;
    let lower = (n * 0.25).floor() as usize;
    let upper = (n * 0.75).ceil() as usize;

    average(&sorted[lower..upper], decimals)
}

/// Absolute differences between consecutive samples.
pub fn consecutive_deltas(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|pair| (pair[1] - pair[0]).abs()).collect()
}

/// Reduce per-tick bandwidth samples to one speed figure.
///
/// Samples are sorted descending and the two highest dropped; of what
/// remains only the leading two thirds are averaged. Highs are trimmed
/// harder than lows. An empty trimmed window falls back to the plain mean.
pub fn trimmed_speed(samples: &[f64]) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let without_two_highest = sorted.get(2..).unwrap_or_default();
    let window = without_two_highest.len() * 2 / 3;

    average(&without_two_highest[..window], None)
        .or_else(|| average(samples, None))
        .unwrap_or(0.0)
}
