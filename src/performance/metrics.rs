//! Per-query-type execution metrics.

use crate::monitoring::stats::RollingStats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTypeMetrics {
    pub query_type: String,
    /// Database executions (cache hits excluded)
    pub executions: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub total_rows: u64,
    pub cache_hits: u64,
    /// Percent of lookups answered from cache
    pub cache_hit_rate: f64,
    pub errors: u64,
}

impl QueryTypeMetrics {
    pub fn lookups(&self) -> u64 {
        self.executions + self.cache_hits
    }
}

/// Accumulates timings for one query type.
#[derive(Debug, Clone, Default)]
pub struct QueryTypeTracker {
    timing: RollingStats,
    total_rows: u64,
    cache_hits: u64,
    errors: u64,
    degraded: bool,
}

impl QueryTypeTracker {
    pub fn record_execution(&mut self, duration_ms: f64, rows: usize) {
        self.timing.record(duration_ms);
        self.total_rows += rows as u64;
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn executions(&self) -> u64 {
        self.timing.count()
    }

    pub fn avg_time_ms(&self) -> f64 {
        self.timing.mean()
    }

    /// Flag the tracker as degraded when the average crosses `threshold_ms`
    /// with at least `min_samples` executions. Returns true only on the
    /// transition into the degraded state.
    pub fn check_degradation(&mut self, threshold_ms: f64, min_samples: u64) -> bool {
        let degraded = self.timing.count() >= min_samples && self.timing.mean() > threshold_ms;
        let crossed = degraded && !self.degraded;
        self.degraded = degraded;
        crossed
    }

    pub fn snapshot(&self, query_type: &str) -> QueryTypeMetrics {
        let executions = self.timing.count();
        let lookups = executions + self.cache_hits;
        QueryTypeMetrics {
            query_type: query_type.to_string(),
            executions,
            total_time_ms: self.timing.total(),
            avg_time_ms: self.timing.mean(),
            min_time_ms: self.timing.min(),
            max_time_ms: self.timing.max(),
            total_rows: self.total_rows,
            cache_hits: self.cache_hits,
            cache_hit_rate: if lookups > 0 {
                self.cache_hits as f64 / lookups as f64 * 100.0
            } else {
                0.0
            },
            errors: self.errors,
        }
    }
}
