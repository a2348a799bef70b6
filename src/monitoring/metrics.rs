use super::{AlertSeverity, HealthStatus};
use prometheus::{
    exponential_buckets, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry,
};
use std::sync::Arc;
use tracing::error;

/// Prometheus metrics for pool health, query latency and the query cache.
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Health monitor
    pub health_checks_total: IntCounter,
    pub health_check_failures_total: IntCounter,
    pub health_status: IntGauge,
    pub alerts_total: IntCounterVec,

    // Connection pool
    pub pool_utilization_percent: Gauge,
    pub pool_active_leases: IntGauge,
    pub acquisition_p95_ms: Gauge,

    // Queries
    pub query_duration_seconds: HistogramVec,
    pub query_errors_total: IntCounterVec,
    pub cache_hits_total: IntCounterVec,
    pub cache_misses_total: IntCounterVec,
    pub cache_entries: IntGauge,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let health_checks_total = IntCounter::with_opts(Opts::new(
            "festival_db_health_checks_total",
            "Total number of connection health checks performed",
        ))?;
        registry.register(Box::new(health_checks_total.clone()))?;

        let health_check_failures_total = IntCounter::with_opts(Opts::new(
            "festival_db_health_check_failures_total",
            "Health checks that ended UNAVAILABLE",
        ))?;
        registry.register(Box::new(health_check_failures_total.clone()))?;

        let health_status = IntGauge::with_opts(Opts::new(
            "festival_db_health_status",
            "Last health status (0 healthy, 1 warning, 2 critical, 3 unavailable)",
        ))?;
        registry.register(Box::new(health_status.clone()))?;

        let alerts_total = IntCounterVec::new(
            Opts::new("festival_db_alerts_total", "Alerts generated by severity"),
            &["severity"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        let pool_utilization_percent = Gauge::with_opts(Opts::new(
            "festival_db_pool_utilization_percent",
            "Connection pool utilization percentage",
        ))?;
        registry.register(Box::new(pool_utilization_percent.clone()))?;

        let pool_active_leases = IntGauge::with_opts(Opts::new(
            "festival_db_pool_active_leases",
            "Connections currently leased from the pool",
        ))?;
        registry.register(Box::new(pool_active_leases.clone()))?;

        let acquisition_p95_ms = Gauge::with_opts(Opts::new(
            "festival_db_acquisition_p95_ms",
            "95th percentile connection acquisition time in milliseconds",
        ))?;
        registry.register(Box::new(acquisition_p95_ms.clone()))?;

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "festival_db_query_duration_seconds",
                "Duration of optimized queries in seconds",
            )
            .buckets(exponential_buckets(0.001, 2.0, 15)?),
            &["query_type"],
        )?;
        registry.register(Box::new(query_duration_seconds.clone()))?;

        let query_errors_total = IntCounterVec::new(
            Opts::new("festival_db_query_errors_total", "Failed queries by type"),
            &["query_type"],
        )?;
        registry.register(Box::new(query_errors_total.clone()))?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new("festival_db_cache_hits_total", "Query cache hits by type"),
            &["query_type"],
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let cache_misses_total = IntCounterVec::new(
            Opts::new("festival_db_cache_misses_total", "Query cache misses by type"),
            &["query_type"],
        )?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        let cache_entries = IntGauge::with_opts(Opts::new(
            "festival_db_cache_entries",
            "Entries currently held in the query cache",
        ))?;
        registry.register(Box::new(cache_entries.clone()))?;

        Ok(Self {
            registry,
            health_checks_total,
            health_check_failures_total,
            health_status,
            alerts_total,
            pool_utilization_percent,
            pool_active_leases,
            acquisition_p95_ms,
            query_duration_seconds,
            query_errors_total,
            cache_hits_total,
            cache_misses_total,
            cache_entries,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn record_health_check(&self, status: HealthStatus) {
        self.health_checks_total.inc();
        if status == HealthStatus::Unavailable {
            self.health_check_failures_total.inc();
        }
        let level = match status {
            HealthStatus::Healthy => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
            HealthStatus::Unavailable => 3,
        };
        self.health_status.set(level);
    }

    pub fn record_alert(&self, severity: AlertSeverity) {
        let label = severity.to_string();
        self.alerts_total
            .with_label_values(&[label.as_str()])
            .inc();
    }

    pub fn update_pool_metrics(&self, utilization: f64, active_leases: u32, acquisition_p95: f64) {
        self.pool_utilization_percent.set(utilization);
        self.pool_active_leases.set(active_leases as i64);
        self.acquisition_p95_ms.set(acquisition_p95);
    }

    pub fn record_query(&self, query_type: &str, duration_ms: f64, success: bool) {
        self.query_duration_seconds
            .with_label_values(&[query_type])
            .observe(duration_ms / 1000.0);
        if !success {
            self.query_errors_total.with_label_values(&[query_type]).inc();
        }
    }

    pub fn record_cache_lookup(&self, query_type: &str, hit: bool) {
        let counter = if hit {
            &self.cache_hits_total
        } else {
            &self.cache_misses_total
        };
        counter.with_label_values(&[query_type]).inc();
    }

    pub fn set_cache_entries(&self, entries: usize) {
        self.cache_entries.set(entries as i64);
    }

    /// Get metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_recording() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_health_check(HealthStatus::Warning);
        collector.record_health_check(HealthStatus::Unavailable);

        assert_eq!(collector.health_checks_total.get(), 2);
        assert_eq!(collector.health_check_failures_total.get(), 1);
        assert_eq!(collector.health_status.get(), 3);
    }

    #[test]
    fn test_query_and_cache_metrics_exported() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_query("ticket_by_id", 12.0, true);
        collector.record_query("ticket_by_id", 30.0, false);
        collector.record_cache_lookup("ticket_by_id", true);
        collector.record_alert(AlertSeverity::Critical);

        assert_eq!(
            collector
                .query_errors_total
                .with_label_values(&["ticket_by_id"])
                .get(),
            1
        );

        let text = collector.gather_metrics();
        assert!(text.contains("festival_db_query_duration_seconds"));
        assert!(text.contains("festival_db_cache_hits_total"));
        assert!(text.contains("severity=\"CRITICAL\""));
    }
}
