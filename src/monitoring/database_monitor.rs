use super::stats::RollingStats;
use crate::database::{DatabaseClient, Statement};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Failure rate (percent of connection attempts) above which the monitor
/// reports a warning.
pub const CONNECTION_FAILURE_RATE_WARNING: f64 = 10.0;
/// Average query time above which the monitor reports a warning.
pub const SLOW_AVERAGE_QUERY_MS: f64 = 1000.0;
const MAX_CHECK_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub connection_attempts: u64,
    pub connection_successes: u64,
    pub connection_failures: u64,
    pub query_count: u64,
    pub query_errors: u64,
    pub avg_query_time: f64,
    pub last_connection_time: Option<DateTime<Utc>>,
    pub last_query_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub success_rate: f64,
    pub failure_rate: f64,
    pub query_error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealthStatus {
    pub status: MonitorStatus,
    pub metrics: MetricSnapshot,
    pub connection_stats: ConnectionStats,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeCheck {
    pub name: String,
    pub status: CheckStatus,
    pub duration_ms: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Outcome of the probe query itself
    pub status: MonitorStatus,
    pub checks: Vec<ProbeCheck>,
    /// Probe outcome combined with the accumulated counter verdict
    pub overall: MonitorStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MonitorState {
    connection_attempts: u64,
    connection_successes: u64,
    connection_failures: u64,
    query_count: u64,
    query_errors: u64,
    query_times: RollingStats,
    last_connection_time: Option<DateTime<Utc>>,
    last_query_time: Option<DateTime<Utc>>,
    check_history: VecDeque<ProbeResult>,
}

impl MonitorState {
    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            connection_attempts: self.connection_attempts,
            connection_successes: self.connection_successes,
            connection_failures: self.connection_failures,
            query_count: self.query_count,
            query_errors: self.query_errors,
            avg_query_time: self.query_times.mean(),
            last_connection_time: self.last_connection_time,
            last_query_time: self.last_query_time,
        }
    }
}

/// Low-level connection and query counters with a simple health verdict.
#[derive(Debug, Default)]
pub struct DatabaseMonitor {
    state: RwLock<MonitorState>,
}

impl DatabaseMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_connection_attempt(&self) {
        let mut state = self.state.write().await;
        state.connection_attempts += 1;
        state.last_connection_time = Some(Utc::now());
    }

    pub async fn record_connection_success(&self) {
        self.state.write().await.connection_successes += 1;
    }

    pub async fn record_connection_failure(&self, error: &str) {
        self.state.write().await.connection_failures += 1;
        warn!(error = %error, "Database connection failed");
    }

    /// Record a finished query. Failed queries count toward the average too.
    pub async fn record_query(&self, duration_ms: f64, error: Option<&str>) {
        let mut state = self.state.write().await;
        state.query_count += 1;
        if let Some(error) = error {
            state.query_errors += 1;
            debug!(error = %error, duration_ms, "Query recorded as failed");
        }
        state.query_times.record(duration_ms);
        state.last_query_time = Some(Utc::now());
    }

    pub async fn metrics(&self) -> MetricSnapshot {
        self.state.read().await.snapshot()
    }

    /// Mean, min, max and standard deviation of recorded query times.
    pub async fn query_time_stats(&self) -> RollingStats {
        self.state.read().await.query_times
    }

    pub async fn get_health_status(&self) -> DatabaseHealthStatus {
        let metrics = self.metrics().await;
        Self::evaluate(metrics)
    }

    fn evaluate(metrics: MetricSnapshot) -> DatabaseHealthStatus {
        let (success_rate, failure_rate) = if metrics.connection_attempts > 0 {
            let attempts = metrics.connection_attempts as f64;
            (
                metrics.connection_successes as f64 / attempts * 100.0,
                metrics.connection_failures as f64 / attempts * 100.0,
            )
        } else {
            (100.0, 0.0)
        };
        let query_error_rate = if metrics.query_count > 0 {
            metrics.query_errors as f64 / metrics.query_count as f64 * 100.0
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        if failure_rate > CONNECTION_FAILURE_RATE_WARNING {
            warnings.push(format!(
                "High connection failure rate: {failure_rate:.1}% (threshold: {CONNECTION_FAILURE_RATE_WARNING:.0}%)"
            ));
        }
        if metrics.avg_query_time > SLOW_AVERAGE_QUERY_MS {
            warnings.push(format!(
                "Slow average query time: {:.0}ms (threshold: {SLOW_AVERAGE_QUERY_MS:.0}ms)",
                metrics.avg_query_time
            ));
        }

        let status = if warnings.is_empty() {
            MonitorStatus::Healthy
        } else {
            MonitorStatus::Warning
        };

        DatabaseHealthStatus {
            status,
            metrics,
            connection_stats: ConnectionStats {
                success_rate,
                failure_rate,
                query_error_rate,
            },
            warnings,
            timestamp: Utc::now(),
        }
    }

    /// Issue a trivial probe query, recording it as a connection attempt and
    /// as a timed query. Database errors produce an unhealthy result rather
    /// than an error.
    pub async fn perform_health_check(&self, client: &dyn DatabaseClient) -> ProbeResult {
        self.record_connection_attempt().await;
        let start = Instant::now();

        let outcome = client.execute(Statement::new("SELECT 1 AS ok")).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let check = match &outcome {
            Ok(_) => {
                self.record_connection_success().await;
                self.record_query(duration_ms, None).await;
                ProbeCheck {
                    name: "connectivity".to_string(),
                    status: CheckStatus::Pass,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.record_connection_failure(&message).await;
                self.record_query(duration_ms, Some(&message)).await;
                ProbeCheck {
                    name: "connectivity".to_string(),
                    status: CheckStatus::Error,
                    duration_ms,
                    error: Some(message),
                }
            }
        };

        let status = match check.status {
            CheckStatus::Pass => MonitorStatus::Healthy,
            CheckStatus::Error => MonitorStatus::Unhealthy,
        };

        let mut state = self.state.write().await;
        let overall = match (status, Self::evaluate(state.snapshot()).status) {
            (MonitorStatus::Unhealthy, _) => MonitorStatus::Unhealthy,
            (_, verdict) => verdict,
        };

        let result = ProbeResult {
            status,
            checks: vec![check],
            overall,
            timestamp: Utc::now(),
        };

        state.check_history.push_back(result.clone());
        while state.check_history.len() > MAX_CHECK_HISTORY {
            state.check_history.pop_front();
        }

        result
    }

    pub async fn check_history(&self) -> Vec<ProbeResult> {
        self.state.read().await.check_history.iter().cloned().collect()
    }

    pub async fn reset_metrics(&self) {
        *self.state.write().await = MonitorState::default();
        debug!("Database monitor metrics reset");
    }
}
