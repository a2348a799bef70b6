//! Composition root owning the monitoring and optimization services.

use crate::config::{Config, HealthMonitorConfig};
use crate::database::{ConnectionManager, DatabaseClient, PgDatabase};
use crate::monitoring::database_monitor::DatabaseHealthStatus;
use crate::monitoring::{
    ConnectionHealthMonitor, DatabaseMonitor, HealthCheckResult, HealthStatus, MetricsCollector,
};
use crate::performance::{PerformanceService, QueryOptimizer, QuickReport, ReportStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthReport {
    pub status: HealthStatus,
    pub connection: HealthCheckResult,
    pub database: DatabaseHealthStatus,
    pub performance: QuickReport,
    pub timestamp: DateTime<Utc>,
}

/// Owns one instance of each service for the life of the process. The health
/// monitor is built on first use and can be torn down with
/// [`reset_health_monitor`](Self::reset_health_monitor).
pub struct ObservabilityContainer {
    pub config: Config,
    client: Arc<dyn DatabaseClient>,
    connection_manager: Arc<dyn ConnectionManager>,
    metrics: Arc<MetricsCollector>,
    database_monitor: Arc<DatabaseMonitor>,
    health_monitor: Mutex<Option<Arc<ConnectionHealthMonitor>>>,
    performance_service: Arc<PerformanceService>,
}

impl ObservabilityContainer {
    /// Connect to Postgres using `config.database` and wire everything up.
    pub async fn connect(config: Config) -> Result<Self> {
        info!("Initializing observability container");
        config.validate()?;
        let database = Arc::new(PgDatabase::connect(config.database.clone()).await?);
        Self::new(config, database.clone(), database)
    }

    pub fn new(
        config: Config,
        client: Arc<dyn DatabaseClient>,
        connection_manager: Arc<dyn ConnectionManager>,
    ) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new()?);
        let database_monitor = Arc::new(DatabaseMonitor::new());
        let performance_service = Arc::new(
            PerformanceService::new(
                config.service.clone(),
                config.optimizer.clone(),
                database_monitor.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        Ok(Self {
            config,
            client,
            connection_manager,
            metrics,
            database_monitor,
            health_monitor: Mutex::new(None),
            performance_service,
        })
    }

    pub fn get_database_monitor(&self) -> Arc<DatabaseMonitor> {
        self.database_monitor.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn performance_service(&self) -> Arc<PerformanceService> {
        self.performance_service.clone()
    }

    /// Return the health monitor, building it on first call. `options`
    /// overrides the configured settings only when the monitor is built.
    pub async fn get_health_monitor(
        &self,
        options: Option<HealthMonitorConfig>,
    ) -> Result<Arc<ConnectionHealthMonitor>> {
        let mut slot = self.health_monitor.lock().await;
        if let Some(monitor) = slot.as_ref() {
            return Ok(monitor.clone());
        }

        let config = options.unwrap_or_else(|| self.config.health_monitor.clone());
        let monitor = Arc::new(
            ConnectionHealthMonitor::new(
                config,
                self.connection_manager.clone(),
                self.client.clone(),
                self.database_monitor.clone(),
            )?
            .with_metrics(self.metrics.clone()),
        );
        *slot = Some(monitor.clone());
        Ok(monitor)
    }

    /// Shut down and drop the current health monitor, if any.
    pub async fn reset_health_monitor(&self) {
        let monitor = self.health_monitor.lock().await.take();
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
            info!("Health monitor reset");
        }
    }

    /// The optimizer, initializing the performance service if needed.
    pub async fn query_optimizer(&self) -> Result<Arc<QueryOptimizer>> {
        self.performance_service
            .initialize(self.client.clone())
            .await?;
        Ok(self.performance_service.optimizer().await?)
    }

    /// One-shot check across the connection monitor, the low-level counters
    /// and the performance service. Always returns a report.
    pub async fn perform_system_health_check(&self) -> Result<SystemHealthReport> {
        let monitor = self.get_health_monitor(None).await?;
        let connection = monitor.perform_health_check().await;
        let database = self.database_monitor.get_health_status().await;
        let performance = self.performance_service.generate_quick_report().await;

        let performance_status = match performance.status {
            ReportStatus::Healthy => HealthStatus::Healthy,
            ReportStatus::Warning => HealthStatus::Warning,
            ReportStatus::Critical => HealthStatus::Critical,
        };
        let status = connection.status.max(performance_status);

        Ok(SystemHealthReport {
            status,
            connection,
            database,
            performance,
            timestamp: Utc::now(),
        })
    }

    pub async fn shutdown(&self) {
        self.reset_health_monitor().await;
        self.performance_service.shutdown().await;
        info!("Observability container shut down");
    }
}
