pub mod circuit_breaker;
pub mod database_monitor;
pub mod health_monitor;
pub mod metrics;
pub mod stats;

pub use circuit_breaker::*;
pub use database_monitor::*;
pub use health_monitor::*;
pub use metrics::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall or per-component health. Ordered from best to worst so the
/// aggregate of several components is their maximum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unavailable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Critical => "CRITICAL",
            HealthStatus::Unavailable => "UNAVAILABLE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
            AlertSeverity::Emergency => "EMERGENCY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    PoolUtilization,
    ConnectionAcquisition,
    ConnectionErrorRate,
    CircuitBreakerOpen,
    ConnectionState,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::PoolUtilization => "pool_utilization",
            AlertType::ConnectionAcquisition => "connection_acquisition",
            AlertType::ConnectionErrorRate => "connection_error_rate",
            AlertType::CircuitBreakerOpen => "circuit_breaker_open",
            AlertType::ConnectionState => "connection_state",
        }
    }
}

/// A threshold breach observed during a health check. Never mutated after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub metric: String,
    pub observed_value: f64,
    pub threshold: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        observed_value: f64,
        threshold: f64,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            metric: alert_type.as_str().to_string(),
            observed_value,
            threshold,
            message,
            timestamp: Utc::now(),
        }
    }
}
