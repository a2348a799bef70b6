//! Rolling statistics shared by the monitors and the optimizer.

use serde::{Deserialize, Serialize};

/// Incremental mean and variance (Welford). Each sample updates the mean as
/// `mean + (x - mean) / n`, so no running sum is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl RollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min.unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.max.unwrap_or(0.0)
    }

    /// Sum reconstructed from the mean.
    pub fn total(&self) -> f64 {
        self.mean * self.count as f64
    }
}

/// Nearest-rank percentile over an unsorted sample set; `p` in `0..=100`.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_mean_of_three() {
        let mut stats = RollingStats::new();
        stats.record(100.0);
        stats.record(200.0);
        stats.record(300.0);
        assert_relative_eq!(stats.mean(), 200.0);
        assert_relative_eq!(stats.variance(), 10_000.0);
        assert_eq!(stats.min(), 100.0);
        assert_eq!(stats.max(), 300.0);
        assert_relative_eq!(stats.total(), 600.0);
    }

    #[test]
    fn test_empty_stats() {
        let stats = RollingStats::new();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.min(), 0.0);
        assert_eq!(stats.variance(), 0.0);
    }

    #[test]
    fn test_percentiles() {
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&samples, 50.0), 50.0);
        assert_eq!(percentile(&samples, 95.0), 95.0);
        assert_eq!(percentile(&samples, 99.0), 99.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[42.0], 1.0), 42.0);
    }

    proptest! {
        #[test]
        fn prop_mean_independent_of_order(mut values in prop::collection::vec(0.0f64..10_000.0, 1..200)) {
            let mut forward = RollingStats::new();
            values.iter().for_each(|v| forward.record(*v));

            values.reverse();
            let mut backward = RollingStats::new();
            values.iter().for_each(|v| backward.record(*v));

            let naive = values.iter().sum::<f64>() / values.len() as f64;
            prop_assert!((forward.mean() - naive).abs() < 1e-6);
            prop_assert!((forward.mean() - backward.mean()).abs() < 1e-6);
        }
    }
}
