/// Compute round-trip metrics (mean, median, 25th percentile, 75th percentile) from samples in ms
pub fn compute_rtt_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

/// Fraction of started syncs that were overtaken by a newer one.
pub fn superseded_ratio(started: u64, superseded: u64) -> Option<f64> {
    if started == 0 {
        return None;
    }
    Some(superseded as f64 / started as f64)
}
