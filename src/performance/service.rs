//! Performance service facade.
//!
//! Owns the optimizer once initialized, turns optimizer events into service
//! alerts, wraps the raw client so ad-hoc queries are tracked too, and runs
//! the periodic performance report.

use super::optimizer::{
    DeepAnalysisReport, IndexFailure, OptimizerEvent, OptimizerMetrics, QueryOptimizer, QueryType,
};
use crate::config::{OptimizerConfig, ServiceConfig};
use crate::database::{BatchMode, DatabaseClient, QueryResult, Statement};
use crate::error::{MonitorError, Result};
use crate::monitoring::database_monitor::DatabaseHealthStatus;
use crate::monitoring::{DatabaseMonitor, MetricsCollector};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Alerts within the report window above this count make the quick report a warning.
const QUICK_REPORT_ALERT_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlowQuerySeverity {
    Low,
    Medium,
    High,
}

/// Tier a query by execution time: over 200ms is high, over 50ms medium.
pub fn classify_slow_query(execution_time_ms: f64) -> SlowQuerySeverity {
    if execution_time_ms > 200.0 {
        SlowQuerySeverity::High
    } else if execution_time_ms > 50.0 {
        SlowQuerySeverity::Medium
    } else {
        SlowQuerySeverity::Low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceAlertType {
    SlowQuery,
    PerformanceDegradation,
    QueryError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub id: Uuid,
    pub alert_type: PerformanceAlertType,
    pub severity: SlowQuerySeverity,
    pub query_type: Option<QueryType>,
    pub execution_time_ms: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceAlert {
    fn from_event(event: &OptimizerEvent) -> Option<Self> {
        let (alert_type, severity, query_type, execution_time_ms, message) = match event {
            OptimizerEvent::SlowQuery {
                query_type,
                execution_time_ms,
                threshold_ms,
            } => (
                PerformanceAlertType::SlowQuery,
                classify_slow_query(*execution_time_ms),
                *query_type,
                *execution_time_ms,
                format!("{query_type} took {execution_time_ms:.1}ms (threshold {threshold_ms:.0}ms)"),
            ),
            OptimizerEvent::PerformanceDegradation {
                query_type,
                avg_time_ms,
                executions,
            } => (
                PerformanceAlertType::PerformanceDegradation,
                classify_slow_query(*avg_time_ms),
                *query_type,
                *avg_time_ms,
                format!("{query_type} average rose to {avg_time_ms:.1}ms over {executions} executions"),
            ),
            OptimizerEvent::QueryError {
                query_type,
                execution_time_ms,
                error,
            } => (
                PerformanceAlertType::QueryError,
                SlowQuerySeverity::High,
                *query_type,
                *execution_time_ms,
                format!("{query_type} failed: {error}"),
            ),
            OptimizerEvent::DeepAnalysis(_) => return None,
        };

        Some(Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            query_type: Some(query_type),
            execution_time_ms,
            message,
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceEvent {
    PerformanceAlert(PerformanceAlert),
    DeepAnalysisCompleted(DeepAnalysisReport),
    QueryErrorAlert(PerformanceAlert),
    BatchCompleted {
        statements: usize,
        mode: BatchMode,
        duration_ms: f64,
    },
    BatchFailed {
        statements: usize,
        mode: BatchMode,
        duration_ms: f64,
        error: String,
    },
    PerformanceReport(QuickReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickReport {
    pub status: ReportStatus,
    pub initialized: bool,
    pub recent_alerts: usize,
    pub high_severity_alerts: usize,
    pub avg_query_time_ms: f64,
    pub total_queries: u64,
    pub cache_entries: usize,
    pub indexes_created: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub initialized: bool,
    pub estimated_memory_bytes: usize,
    pub alert_buffer_len: usize,
    pub alert_buffer_capacity: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedReport {
    pub summary: QuickReport,
    pub optimizer: Option<OptimizerMetrics>,
    pub alert_breakdown: BTreeMap<String, usize>,
    pub recent_alerts: Vec<PerformanceAlert>,
    pub database: DatabaseHealthStatus,
    pub service_health: ServiceHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyOptimizationSummary {
    pub analysis: DeepAnalysisReport,
    pub indexes_applied: Vec<String>,
    pub index_failures: Vec<IndexFailure>,
    pub statistics_refreshed: bool,
    pub duration_ms: f64,
}

/// Bounded FIFO of recent service alerts.
#[derive(Clone)]
struct AlertBuffer {
    alerts: Arc<RwLock<VecDeque<PerformanceAlert>>>,
    capacity: usize,
}

impl AlertBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            alerts: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    async fn push(&self, alert: PerformanceAlert) {
        let mut alerts = self.alerts.write().await;
        alerts.push_back(alert);
        while alerts.len() > self.capacity {
            alerts.pop_front();
        }
    }

    async fn since(&self, cutoff: DateTime<Utc>) -> Vec<PerformanceAlert> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| a.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    async fn all(&self) -> Vec<PerformanceAlert> {
        self.alerts.read().await.iter().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.alerts.read().await.len()
    }
}

/// Client wrapper that records every statement with the [`DatabaseMonitor`]
/// and publishes batch outcomes.
pub struct TrackedClient {
    inner: Arc<dyn DatabaseClient>,
    monitor: Arc<DatabaseMonitor>,
    events: broadcast::Sender<ServiceEvent>,
}

impl TrackedClient {
    pub fn new(
        inner: Arc<dyn DatabaseClient>,
        monitor: Arc<DatabaseMonitor>,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Self {
        Self {
            inner,
            monitor,
            events,
        }
    }
}

#[async_trait]
impl DatabaseClient for TrackedClient {
    async fn execute(&self, statement: Statement) -> Result<QueryResult> {
        let start = Instant::now();
        let result = self.inner.execute(statement).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => self.monitor.record_query(duration_ms, None).await,
            Err(e) => {
                self.monitor
                    .record_query(duration_ms, Some(&e.to_string()))
                    .await
            }
        }
        result
    }

    async fn batch(&self, statements: Vec<Statement>, mode: BatchMode) -> Result<Vec<QueryResult>> {
        let count = statements.len();
        let start = Instant::now();
        let result = self.inner.batch(statements, mode).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let event = match &result {
            Ok(_) => {
                self.monitor.record_query(duration_ms, None).await;
                debug!(statements = count, ?mode, duration_ms, "Batch completed");
                ServiceEvent::BatchCompleted {
                    statements: count,
                    mode,
                    duration_ms,
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.monitor.record_query(duration_ms, Some(&message)).await;
                error!(statements = count, ?mode, duration_ms, error = %message, "Batch failed");
                ServiceEvent::BatchFailed {
                    statements: count,
                    mode,
                    duration_ms,
                    error: message,
                }
            }
        };
        let _ = self.events.send(event);
        result
    }
}

struct ServiceRuntime {
    optimizer: Arc<QueryOptimizer>,
    client: Arc<TrackedClient>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PerformanceService {
    config: ServiceConfig,
    optimizer_config: OptimizerConfig,
    database_monitor: Arc<DatabaseMonitor>,
    metrics: Option<Arc<MetricsCollector>>,
    runtime: Mutex<Option<ServiceRuntime>>,
    alerts: AlertBuffer,
    events: broadcast::Sender<ServiceEvent>,
}

impl PerformanceService {
    pub fn new(
        config: ServiceConfig,
        optimizer_config: OptimizerConfig,
        database_monitor: Arc<DatabaseMonitor>,
    ) -> Self {
        let (events, _) = broadcast::channel(1000);
        let alerts = AlertBuffer::new(config.max_recent_alerts);
        Self {
            config,
            optimizer_config,
            database_monitor,
            metrics: None,
            runtime: Mutex::new(None),
            alerts,
            events,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Build the optimizer over `client` and start background tasks.
    /// Subsequent calls are no-ops.
    ///
    /// Baseline optimization runs after the runtime is published, so reports
    /// and accessors answer while indexes are being built.
    pub async fn initialize(self: &Arc<Self>, client: Arc<dyn DatabaseClient>) -> Result<()> {
        let optimizer = {
            let mut runtime = self.runtime.lock().await;
            if runtime.is_some() {
                debug!("Performance service already initialized");
                return Ok(());
            }

            let mut optimizer = QueryOptimizer::new(
                client.clone(),
                self.database_monitor.clone(),
                self.optimizer_config.clone(),
            )?;
            if let Some(metrics) = &self.metrics {
                optimizer = optimizer.with_metrics(metrics.clone());
            }
            let optimizer = Arc::new(optimizer);

            let tracked = Arc::new(TrackedClient::new(
                client,
                self.database_monitor.clone(),
                self.events.clone(),
            ));

            let (shutdown_tx, _) = broadcast::channel(1);
            let mut tasks = vec![spawn_event_listener(
                optimizer.subscribe(),
                shutdown_tx.subscribe(),
                self.alerts.clone(),
                self.events.clone(),
            )];

            if self.config.auto_reporting {
                tasks.push(spawn_reporter(
                    Arc::downgrade(self),
                    self.config.report_interval(),
                    shutdown_tx.subscribe(),
                ));
            }

            *runtime = Some(ServiceRuntime {
                optimizer: optimizer.clone(),
                client: tracked,
                shutdown_tx,
                tasks,
            });
            optimizer
        };
        info!(
            auto_reporting = self.config.auto_reporting,
            "Performance service initialized"
        );

        if self.config.baseline_optimization {
            let report = optimizer.create_festival_indexes().await;
            if !report.errors.is_empty() {
                warn!(errors = report.errors.len(), "Baseline index creation had failures");
            }
            if let Err(e) = optimizer.refresh_statistics().await {
                warn!(error = %e, "Baseline statistics refresh failed");
            }
        }
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    pub async fn optimizer(&self) -> Result<Arc<QueryOptimizer>> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|r| r.optimizer.clone())
            .ok_or(MonitorError::NotInitialized)
    }

    /// The tracked client handed to application code.
    pub async fn database_client(&self) -> Result<Arc<dyn DatabaseClient>> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|r| r.client.clone() as Arc<dyn DatabaseClient>)
            .ok_or(MonitorError::NotInitialized)
    }

    pub async fn trigger_emergency_optimization(&self) -> Result<EmergencyOptimizationSummary> {
        let optimizer = self.optimizer().await?;
        let start = Instant::now();
        warn!("Emergency optimization triggered");

        let analysis = optimizer.perform_deep_analysis().await;

        let mut pending: Vec<String> = Vec::new();
        for rec in &analysis.recommendations {
            for index in &rec.suggested_indexes {
                if !pending.contains(index) {
                    pending.push(index.clone());
                }
            }
        }

        let mut indexes_applied = Vec::new();
        let mut index_failures = Vec::new();
        for index in pending {
            match optimizer.create_index(&index).await {
                Ok(()) => indexes_applied.push(index),
                Err(e) => {
                    warn!(index = %index, error = %e, "Emergency index creation failed");
                    index_failures.push(IndexFailure {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }

        let statistics_refreshed = match optimizer.refresh_statistics().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Statistics refresh failed during emergency optimization");
                false
            }
        };

        let summary = EmergencyOptimizationSummary {
            analysis,
            indexes_applied,
            index_failures,
            statistics_refreshed,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        info!(
            applied = summary.indexes_applied.len(),
            failed = summary.index_failures.len(),
            duration_ms = summary.duration_ms,
            "Emergency optimization finished"
        );
        Ok(summary)
    }

    pub async fn generate_quick_report(&self) -> QuickReport {
        let cutoff = Utc::now()
            .checked_sub_signed(self.config.alert_window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recent = self.alerts.since(cutoff).await;
        let high = recent
            .iter()
            .filter(|a| a.severity == SlowQuerySeverity::High)
            .count();

        let status = if high > 0 {
            ReportStatus::Critical
        } else if recent.len() > QUICK_REPORT_ALERT_LIMIT {
            ReportStatus::Warning
        } else {
            ReportStatus::Healthy
        };

        let db = self.database_monitor.metrics().await;
        let optimizer = self.optimizer().await.ok();
        let (cache_entries, indexes_created) = match &optimizer {
            Some(optimizer) => (optimizer.cache_size().await, optimizer.indexes_created()),
            None => (0, false),
        };

        QuickReport {
            status,
            initialized: optimizer.is_some(),
            recent_alerts: recent.len(),
            high_severity_alerts: high,
            avg_query_time_ms: db.avg_query_time,
            total_queries: db.query_count,
            cache_entries,
            indexes_created,
            timestamp: Utc::now(),
        }
    }

    pub async fn get_detailed_report(&self) -> DetailedReport {
        let summary = self.generate_quick_report().await;
        let optimizer = self.optimizer().await.ok();

        let (optimizer_metrics, estimated_memory_bytes) = match &optimizer {
            Some(optimizer) => (
                Some(optimizer.get_performance_metrics().await),
                optimizer.estimated_memory_bytes().await,
            ),
            None => (None, 0),
        };

        let recent_alerts = self.alerts.all().await;
        let mut alert_breakdown = BTreeMap::new();
        for alert in &recent_alerts {
            let key = serde_json::to_value(alert.alert_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{:?}", alert.alert_type));
            *alert_breakdown.entry(key).or_insert(0) += 1;
        }

        let alert_buffer_len = recent_alerts.len();
        let mut issues = Vec::new();
        if optimizer.is_none() {
            issues.push("Performance service is not initialized".to_string());
        }
        if estimated_memory_bytes > self.config.memory_warning_bytes {
            issues.push(format!(
                "Query cache holds an estimated {:.1}MB",
                estimated_memory_bytes as f64 / (1024.0 * 1024.0)
            ));
        }
        if alert_buffer_len >= self.alerts.capacity {
            issues.push(format!(
                "Alert buffer is full ({} alerts); older alerts are being dropped",
                self.alerts.capacity
            ));
        }

        DetailedReport {
            summary,
            optimizer: optimizer_metrics,
            alert_breakdown,
            recent_alerts,
            database: self.database_monitor.get_health_status().await,
            service_health: ServiceHealth {
                initialized: optimizer.is_some(),
                estimated_memory_bytes,
                alert_buffer_len,
                alert_buffer_capacity: self.alerts.capacity,
                issues,
            },
        }
    }

    pub async fn recent_alert_count(&self) -> usize {
        self.alerts.len().await
    }

    /// Stop background tasks and release the optimizer and client.
    pub async fn shutdown(&self) {
        // Release the lock before joining; the reporter reads it mid-tick.
        let runtime = self.runtime.lock().await.take();
        if let Some(runtime) = runtime {
            let _ = runtime.shutdown_tx.send(());
            for task in runtime.tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "Performance service task ended abnormally");
                    }
                }
            }
            info!("Performance service shut down");
        }
    }
}

fn spawn_event_listener(
    mut optimizer_events: broadcast::Receiver<OptimizerEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
    alerts: AlertBuffer,
    events: broadcast::Sender<ServiceEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                received = optimizer_events.recv() => match received {
                    Ok(event) => handle_optimizer_event(event, &alerts, &events).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Performance listener lagged behind optimizer events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Performance event listener stopped");
    })
}

async fn handle_optimizer_event(
    event: OptimizerEvent,
    alerts: &AlertBuffer,
    events: &broadcast::Sender<ServiceEvent>,
) {
    if let OptimizerEvent::DeepAnalysis(report) = event {
        let _ = events.send(ServiceEvent::DeepAnalysisCompleted(report));
        return;
    }

    if let Some(alert) = PerformanceAlert::from_event(&event) {
        alerts.push(alert.clone()).await;
        let service_event = match alert.alert_type {
            PerformanceAlertType::QueryError => ServiceEvent::QueryErrorAlert(alert),
            _ => ServiceEvent::PerformanceAlert(alert),
        };
        let _ = events.send(service_event);
    }
}

fn spawn_reporter(
    service: Weak<PerformanceService>,
    period: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let Some(service) = service.upgrade() else { break };
                    let report = service.generate_quick_report().await;
                    info!(
                        status = ?report.status,
                        recent_alerts = report.recent_alerts,
                        avg_query_time_ms = report.avg_query_time_ms,
                        "Performance report"
                    );
                    let _ = service.events.send(ServiceEvent::PerformanceReport(report));
                }
            }
        }
        debug!("Performance reporter stopped");
    })
}
