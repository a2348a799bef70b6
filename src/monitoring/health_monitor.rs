//! Circuit-breaker protected connection health monitoring.
//!
//! Each check reads pool statistics and the connection state machine, probes
//! the database through [`DatabaseMonitor`], and turns threshold breaches into
//! tiered alerts. Results and alerts are kept in bounded histories.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use super::database_monitor::{DatabaseMonitor, MonitorStatus, ProbeResult};
use super::metrics::MetricsCollector;
use super::stats::percentile;
use super::{Alert, AlertSeverity, AlertType, HealthStatus};
use crate::config::{AlertThresholds, HealthMonitorConfig};
use crate::database::{
    ConnectionManager, ConnectionState, DatabaseClient, PoolHealthStatus, PoolStatistics,
};
use crate::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolComponent {
    pub status: HealthStatus,
    pub utilization_percent: f64,
    pub active_leases: u32,
    pub max_connections: u32,
    pub error_rate_percent: f64,
    pub acquisition_p95_ms: f64,
    pub probe: ProbeResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerComponent {
    pub status: HealthStatus,
    pub stats: CircuitBreakerStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineComponent {
    pub status: HealthStatus,
    pub health: PoolHealthStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthComponents {
    pub connection_pool: PoolComponent,
    pub circuit_breaker: BreakerComponent,
    pub state_machine: StateMachineComponent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: usize,
}

impl LatencyPercentiles {
    pub fn from_samples(samples: &[f64]) -> Self {
        Self {
            p50: percentile(samples, 50.0),
            p95: percentile(samples, 95.0),
            p99: percentile(samples, 99.0),
            samples: samples.len(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryExecutionStats {
    pub total_queries: u64,
    pub query_errors: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub std_dev_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub connection_acquisition: LatencyPercentiles,
    pub query_execution: QueryExecutionStats,
    pub pool_utilization_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    /// `None` when the check could not run
    pub components: Option<HealthComponents>,
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
    pub performance_metrics: Option<PerformanceMetrics>,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringStats {
    pub total_health_checks: u64,
    pub health_check_failures: u64,
    pub alerts_generated: u64,
    pub last_check_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MonitorHistory {
    metrics_history: VecDeque<HealthCheckResult>,
    alert_history: VecDeque<Alert>,
    current_alerts: Vec<Alert>,
    stats: MonitoringStats,
}

/// Sub-checks that run under breaker protection.
struct ComponentChecks {
    connection_pool: PoolComponent,
    state_machine: StateMachineComponent,
    alerts: Vec<Alert>,
    performance_metrics: PerformanceMetrics,
}

struct PeriodicTask {
    handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Compare `observed` against a warning/critical pair.
pub fn evaluate_threshold(observed: f64, warning: f64, critical: f64) -> Option<AlertSeverity> {
    if observed >= critical {
        Some(AlertSeverity::Critical)
    } else if observed >= warning {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

fn severity_status(severity: AlertSeverity) -> HealthStatus {
    match severity {
        AlertSeverity::Info => HealthStatus::Healthy,
        AlertSeverity::Warning => HealthStatus::Warning,
        AlertSeverity::Critical | AlertSeverity::Emergency => HealthStatus::Critical,
    }
}

/// Heuristic follow-up actions for a set of alerts, without duplicates.
pub fn derive_recommendations(alerts: &[Alert]) -> Vec<String> {
    let mut recommendations: Vec<String> = Vec::new();
    for alert in alerts {
        let advice = match (alert.alert_type, alert.severity) {
            (AlertType::PoolUtilization, AlertSeverity::Warning) => {
                "Pool utilization is high; consider increasing max connections before peak sales"
            }
            (AlertType::PoolUtilization, _) => {
                "Connection pool is near exhaustion; increase max connections or shed load"
            }
            (AlertType::ConnectionAcquisition, _) => {
                "Connection acquisition is slow; look for long-held connections or slow transactions"
            }
            (AlertType::ConnectionErrorRate, _) => {
                "Connection creation errors are elevated; verify database reachability and credentials"
            }
            (AlertType::CircuitBreakerOpen, _) => {
                "Circuit breaker is open; the database is failing probes, wait for recovery before retrying"
            }
            (AlertType::ConnectionState, _) => {
                "Connection state machine is not connected; check network and database availability"
            }
        };
        if !recommendations.iter().any(|r| r == advice) {
            recommendations.push(advice.to_string());
        }
    }
    recommendations
}

pub struct ConnectionHealthMonitor {
    config: HealthMonitorConfig,
    connection_manager: Arc<dyn ConnectionManager>,
    client: Arc<dyn DatabaseClient>,
    database_monitor: Arc<DatabaseMonitor>,
    circuit_breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<MetricsCollector>>,
    history: RwLock<MonitorHistory>,
    periodic: Mutex<Option<PeriodicTask>>,
}

impl ConnectionHealthMonitor {
    pub fn new(
        config: HealthMonitorConfig,
        connection_manager: Arc<dyn ConnectionManager>,
        client: Arc<dyn DatabaseClient>,
        database_monitor: Arc<DatabaseMonitor>,
    ) -> Result<Self> {
        config.validate()?;
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));

        Ok(Self {
            config,
            connection_manager,
            client,
            database_monitor,
            circuit_breaker,
            metrics: None,
            history: RwLock::new(MonitorHistory::default()),
            periodic: Mutex::new(None),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        self.circuit_breaker.clone()
    }

    /// Run one health check. Never fails: breaker rejections and sub-check
    /// errors produce an `Unavailable` result.
    pub async fn perform_health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let outcome: Result<ComponentChecks> = self
            .circuit_breaker
            .execute(|| self.run_checks())
            .await
            .map_err(MonitorError::from);

        // Read after the call settles so a successful trial reports closed.
        let breaker_stats = self.circuit_breaker.stats().await;
        let mut alerts = Vec::new();
        let circuit_breaker = Self::check_circuit_breaker(breaker_stats, &mut alerts);

        let result = match outcome {
            Ok(checks) => {
                alerts.extend(checks.alerts);
                let status = [
                    checks.connection_pool.status,
                    circuit_breaker.status,
                    checks.state_machine.status,
                ]
                .into_iter()
                .max()
                .unwrap_or(HealthStatus::Healthy);
                let recommendations = derive_recommendations(&alerts);

                HealthCheckResult {
                    status,
                    components: Some(HealthComponents {
                        connection_pool: checks.connection_pool,
                        circuit_breaker,
                        state_machine: checks.state_machine,
                    }),
                    alerts,
                    recommendations,
                    performance_metrics: Some(checks.performance_metrics),
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    timestamp: Utc::now(),
                    error: None,
                }
            }
            Err(e) => {
                error!(error = %e, breaker = %circuit_breaker.stats.state, "Health check failed");
                let recommendations = derive_recommendations(&alerts);
                HealthCheckResult {
                    status: HealthStatus::Unavailable,
                    components: None,
                    alerts,
                    recommendations,
                    performance_metrics: None,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    timestamp: Utc::now(),
                    error: Some(e.to_string()),
                }
            }
        };

        self.record_result(&result).await;
        result
    }

    async fn run_checks(&self) -> Result<ComponentChecks> {
        let (pool_stats, pool_health) = futures::try_join!(
            self.connection_manager.pool_statistics(),
            self.connection_manager.pool_health_status()
        )?;

        let probe = self
            .database_monitor
            .perform_health_check(self.client.as_ref())
            .await;
        if probe.status == MonitorStatus::Unhealthy {
            let reason = probe
                .checks
                .iter()
                .find_map(|c| c.error.clone())
                .unwrap_or_else(|| "probe failed".to_string());
            return Err(MonitorError::Connectivity(reason));
        }

        let mut alerts = Vec::new();
        let connection_pool = self.check_connection_pool(&pool_stats, probe, &mut alerts);
        let state_machine = Self::check_state_machine(pool_health, &mut alerts);

        let query_times = self.database_monitor.query_time_stats().await;
        let db_metrics = self.database_monitor.metrics().await;
        let performance_metrics = PerformanceMetrics {
            connection_acquisition: LatencyPercentiles::from_samples(
                &pool_stats.acquisition_times_ms,
            ),
            query_execution: QueryExecutionStats {
                total_queries: db_metrics.query_count,
                query_errors: db_metrics.query_errors,
                avg_ms: query_times.mean(),
                min_ms: query_times.min(),
                max_ms: query_times.max(),
                std_dev_ms: query_times.std_dev(),
            },
            pool_utilization_percent: pool_stats.utilization_percentage(),
        };

        if let Some(metrics) = &self.metrics {
            metrics.update_pool_metrics(
                performance_metrics.pool_utilization_percent,
                pool_stats.active_leases,
                performance_metrics.connection_acquisition.p95,
            );
        }

        Ok(ComponentChecks {
            connection_pool,
            state_machine,
            alerts,
            performance_metrics,
        })
    }

    fn check_connection_pool(
        &self,
        stats: &PoolStatistics,
        probe: ProbeResult,
        alerts: &mut Vec<Alert>,
    ) -> PoolComponent {
        let thresholds: &AlertThresholds = &self.config.thresholds;
        let utilization = stats.utilization_percentage();
        let error_rate = stats.error_rate_percentage();
        let acquisition_p95 = percentile(&stats.acquisition_times_ms, 95.0);
        let mut status = HealthStatus::Healthy;

        if let Some(severity) = evaluate_threshold(
            utilization,
            thresholds.pool_utilization_warning,
            thresholds.pool_utilization_critical,
        ) {
            let threshold = match severity {
                AlertSeverity::Critical => thresholds.pool_utilization_critical,
                _ => thresholds.pool_utilization_warning,
            };
            alerts.push(Alert::new(
                AlertType::PoolUtilization,
                severity,
                utilization,
                threshold,
                format!(
                    "Connection pool at {utilization:.1}% utilization ({}/{} connections leased, threshold {threshold:.0}%)",
                    stats.active_leases, stats.max_connections
                ),
            ));
            status = status.max(severity_status(severity));
        }

        if let Some(severity) = evaluate_threshold(
            acquisition_p95,
            thresholds.connection_acquisition_warning_ms,
            thresholds.connection_acquisition_critical_ms,
        ) {
            let threshold = match severity {
                AlertSeverity::Critical => thresholds.connection_acquisition_critical_ms,
                _ => thresholds.connection_acquisition_warning_ms,
            };
            alerts.push(Alert::new(
                AlertType::ConnectionAcquisition,
                severity,
                acquisition_p95,
                threshold,
                format!(
                    "Connection acquisition p95 is {acquisition_p95:.0}ms (threshold {threshold:.0}ms)"
                ),
            ));
            status = status.max(severity_status(severity));
        }

        if let Some(severity) = evaluate_threshold(
            error_rate,
            thresholds.error_rate_warning,
            thresholds.error_rate_critical,
        ) {
            let threshold = match severity {
                AlertSeverity::Critical => thresholds.error_rate_critical,
                _ => thresholds.error_rate_warning,
            };
            alerts.push(Alert::new(
                AlertType::ConnectionErrorRate,
                severity,
                error_rate,
                threshold,
                format!(
                    "Connection error rate is {error_rate:.1}% ({} errors / {} created, threshold {threshold:.0}%)",
                    stats.connection_creation_errors, stats.total_connections_created
                ),
            ));
            status = status.max(severity_status(severity));
        }

        PoolComponent {
            status,
            utilization_percent: utilization,
            active_leases: stats.active_leases,
            max_connections: stats.max_connections,
            error_rate_percent: error_rate,
            acquisition_p95_ms: acquisition_p95,
            probe,
        }
    }

    fn check_circuit_breaker(stats: CircuitBreakerStats, alerts: &mut Vec<Alert>) -> BreakerComponent {
        let status = match stats.state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Warning,
            CircuitState::Open => {
                alerts.push(Alert::new(
                    AlertType::CircuitBreakerOpen,
                    AlertSeverity::Critical,
                    stats.consecutive_failures as f64,
                    stats.failure_threshold as f64,
                    format!(
                        "Circuit breaker is open after {} consecutive failures",
                        stats.consecutive_failures
                    ),
                ));
                HealthStatus::Critical
            }
        };
        BreakerComponent { status, stats }
    }

    fn check_state_machine(health: PoolHealthStatus, alerts: &mut Vec<Alert>) -> StateMachineComponent {
        let (status, severity) = match health.state {
            ConnectionState::Connected => (HealthStatus::Healthy, None),
            ConnectionState::Degraded | ConnectionState::Reconnecting => {
                (HealthStatus::Warning, Some(AlertSeverity::Warning))
            }
            ConnectionState::Disconnected => (HealthStatus::Critical, Some(AlertSeverity::Critical)),
            ConnectionState::Failed => (HealthStatus::Critical, Some(AlertSeverity::Emergency)),
        };

        if let Some(severity) = severity {
            alerts.push(Alert::new(
                AlertType::ConnectionState,
                severity,
                health.consecutive_failures as f64,
                0.0,
                format!(
                    "Connection state is {} after {} consecutive failures{}",
                    health.state,
                    health.consecutive_failures,
                    health
                        .last_error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default()
                ),
            ));
        }

        StateMachineComponent { status, health }
    }

    async fn record_result(&self, result: &HealthCheckResult) {
        let mut history = self.history.write().await;

        history.stats.total_health_checks += 1;
        history.stats.last_check_time = Some(result.timestamp);
        if result.status == HealthStatus::Unavailable {
            history.stats.health_check_failures += 1;
        }

        for alert in &result.alerts {
            match alert.severity {
                AlertSeverity::Emergency | AlertSeverity::Critical => {
                    error!(metric = %alert.metric, value = alert.observed_value, "{}", alert.message)
                }
                AlertSeverity::Warning => {
                    warn!(metric = %alert.metric, value = alert.observed_value, "{}", alert.message)
                }
                AlertSeverity::Info => info!(metric = %alert.metric, "{}", alert.message),
            }
            history.alert_history.push_back(alert.clone());
            if let Some(metrics) = &self.metrics {
                metrics.record_alert(alert.severity);
            }
        }
        history.stats.alerts_generated += result.alerts.len() as u64;
        while history.alert_history.len() > self.config.max_alert_history {
            history.alert_history.pop_front();
        }
        history.current_alerts = result.alerts.clone();

        history.metrics_history.push_back(result.clone());
        let cutoff = Utc::now().checked_sub_signed(self.config.metrics_retention());
        while history.metrics_history.len() > self.config.max_historical_entries
            || match (history.metrics_history.front(), cutoff) {
                (Some(oldest), Some(cutoff)) => oldest.timestamp < cutoff,
                _ => false,
            }
        {
            history.metrics_history.pop_front();
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_health_check(result.status);
        }

        debug!(
            status = %result.status,
            alerts = result.alerts.len(),
            duration_ms = result.duration_ms,
            "Health check recorded"
        );
    }

    /// Start the periodic check timer. Calling again while running is a no-op.
    pub async fn start_periodic_monitoring(self: &Arc<Self>) {
        let mut periodic = self.periodic.lock().await;
        if periodic.is_some() {
            debug!("Periodic health monitoring already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let monitor = Arc::clone(self);
        let period = self.config.check_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        // Runs to completion even if shutdown arrives meanwhile.
                        monitor.perform_health_check().await;
                    }
                }
            }
            debug!("Periodic health monitoring loop exited");
        });

        info!(
            interval_ms = self.config.check_interval_ms,
            "Started periodic health monitoring"
        );
        *periodic = Some(PeriodicTask {
            handle,
            shutdown_tx,
        });
    }

    /// Stop scheduling new checks. An in-flight check completes.
    pub async fn stop_periodic_monitoring(&self) {
        if let Some(task) = self.periodic.lock().await.take() {
            let _ = task.shutdown_tx.send(());
            drop(task.handle);
            info!("Stopped periodic health monitoring");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.periodic
            .lock()
            .await
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        self.stop_periodic_monitoring().await;
        self.circuit_breaker.reset().await;
        info!("Connection health monitor shut down");
    }

    /// Alerts raised by the most recent check.
    pub async fn get_current_alerts(&self) -> Vec<Alert> {
        self.history.read().await.current_alerts.clone()
    }

    /// Alert history, newest first.
    pub async fn get_alert_history(&self, limit: Option<usize>) -> Vec<Alert> {
        let history = self.history.read().await;
        let mut alerts: Vec<Alert> = history.alert_history.iter().cloned().collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            alerts.truncate(limit);
        }
        alerts
    }

    /// Check results with `start <= timestamp <= end`; open bounds match all.
    pub async fn get_historical_metrics(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<HealthCheckResult> {
        self.history
            .read()
            .await
            .metrics_history
            .iter()
            .filter(|r| start.map_or(true, |s| r.timestamp >= s))
            .filter(|r| end.map_or(true, |e| r.timestamp <= e))
            .cloned()
            .collect()
    }

    pub async fn get_monitoring_stats(&self) -> MonitoringStats {
        self.history.read().await.stats.clone()
    }

    pub async fn get_last_result(&self) -> Option<HealthCheckResult> {
        self.history.read().await.metrics_history.back().cloned()
    }
}
