//! Performance service and composition root tests.

mod test_helpers;

use anyhow::Result;
use festival_dbmon::{
    config::OptimizerConfig,
    performance::{PerformanceAlertType, FESTIVAL_INDEXES},
    BatchMode, Config, DatabaseClient, DatabaseMonitor, HealthStatus, ObservabilityContainer, PerformanceService,
    ReportStatus, ServiceEvent, SlowQuerySeverity, Statement,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{
    fast_health_config, quiet_service_config, ticket_row, MockConnectionManager,
    MockDatabaseClient,
};
use tokio::sync::broadcast;
use tokio::time::timeout_at;
use tracing_test::traced_test;

fn service() -> Arc<PerformanceService> {
    Arc::new(PerformanceService::new(
        quiet_service_config(),
        OptimizerConfig::default(),
        Arc::new(DatabaseMonitor::new()),
    ))
}

/// Wait for the next service event matching `pred`.
async fn next_event<F>(events: &mut broadcast::Receiver<ServiceEvent>, pred: F) -> Result<ServiceEvent>
where
    F: Fn(&ServiceEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let event = timeout_at(deadline, events.recv()).await??;
        if pred(&event) {
            return Ok(event);
        }
    }
}

#[tokio::test]
#[traced_test]
async fn test_initialize_is_idempotent() -> Result<()> {
    let client = Arc::new(MockDatabaseClient::new());
    let service = service();

    service.initialize(client.clone()).await?;
    let first = service.optimizer().await?;
    service.initialize(client.clone()).await?;
    let second = service.optimizer().await?;

    assert!(Arc::ptr_eq(&first, &second));
    // Baseline optimization ran once
    assert_eq!(client.executed_matching("CREATE INDEX"), FESTIVAL_INDEXES.len());
    assert_eq!(client.executed_matching("ANALYZE"), 3);
    assert!(first.indexes_created());

    service.shutdown().await;
    assert!(!service.is_initialized().await);
    Ok(())
}

#[tokio::test]
async fn test_baseline_failures_do_not_block_initialization() -> Result<()> {
    let client = Arc::new(MockDatabaseClient::new());
    client.fail_when("CREATE INDEX", "permission denied");
    client.fail_when("ANALYZE", "permission denied");
    let service = service();

    service.initialize(client).await?;
    assert!(service.is_initialized().await);
    assert!(!service.optimizer().await?.indexes_created());
    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_reports_answer_during_baseline_optimization() -> Result<()> {
    let client = Arc::new(MockDatabaseClient::new());
    client.set_delay(Some(Duration::from_millis(50)));
    let service = service();

    let init = tokio::spawn({
        let service = service.clone();
        let client = client.clone();
        async move { service.initialize(client).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Index creation takes at least 350ms; none of these may wait for it
    let budget = Duration::from_millis(100);
    let report = tokio::time::timeout(budget, service.generate_quick_report()).await?;
    assert!(report.initialized);
    assert!(tokio::time::timeout(budget, service.is_initialized()).await?);
    let optimizer = tokio::time::timeout(budget, service.optimizer()).await??;
    assert!(!optimizer.indexes_created());
    tokio::time::timeout(budget, service.get_detailed_report()).await?;

    // A second initialize returns without repeating the baseline
    tokio::time::timeout(budget, service.initialize(client.clone())).await??;

    init.await??;
    assert!(optimizer.indexes_created());
    assert_eq!(client.executed_matching("CREATE INDEX"), FESTIVAL_INDEXES.len());
    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_tracked_client_records_queries_and_batches() -> Result<()> {
    let client = Arc::new(MockDatabaseClient::new());
    let monitor = Arc::new(DatabaseMonitor::new());
    let service = Arc::new(PerformanceService::new(
        festival_dbmon::config::ServiceConfig {
            baseline_optimization: false,
            ..quiet_service_config()
        },
        OptimizerConfig::default(),
        monitor.clone(),
    ));
    let mut events = service.subscribe();
    service.initialize(client.clone()).await?;

    let tracked = service.database_client().await?;
    tracked.execute(Statement::new("UPDATE orders SET amount = amount")).await?;
    tracked
        .batch(
            vec![
                Statement::new("INSERT INTO orders DEFAULT VALUES"),
                Statement::new("INSERT INTO tickets DEFAULT VALUES"),
            ],
            BatchMode::Write,
        )
        .await?;

    assert_eq!(monitor.metrics().await.query_count, 2);
    match next_event(&mut events, |e| matches!(e, ServiceEvent::BatchCompleted { .. })).await? {
        ServiceEvent::BatchCompleted { statements, mode, .. } => {
            assert_eq!(statements, 2);
            assert_eq!(mode, BatchMode::Write);
        }
        _ => unreachable!(),
    }

    client.fail_when("tickets", "deadlock detected");
    let failed = tracked
        .batch(vec![Statement::new("DELETE FROM tickets")], BatchMode::Deferred)
        .await;
    assert!(failed.is_err());
    assert!(matches!(
        next_event(&mut events, |e| matches!(e, ServiceEvent::BatchFailed { .. })).await?,
        ServiceEvent::BatchFailed { .. }
    ));
    assert_eq!(monitor.metrics().await.query_errors, 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_query_error_becomes_critical_alert() -> Result<()> {
    let client = Arc::new(MockDatabaseClient::new());
    let service = service();
    let mut events = service.subscribe();
    service.initialize(client.clone()).await?;

    assert_eq!(service.generate_quick_report().await.status, ReportStatus::Healthy);

    client.fail_when("qr_code", "connection reset by peer");
    let optimizer = service.optimizer().await?;
    assert!(optimizer.validate_qr_code("QR-9").await.is_err());

    match next_event(&mut events, |e| matches!(e, ServiceEvent::QueryErrorAlert(_))).await? {
        ServiceEvent::QueryErrorAlert(alert) => {
            assert_eq!(alert.alert_type, PerformanceAlertType::QueryError);
            assert_eq!(alert.severity, SlowQuerySeverity::High);
        }
        _ => unreachable!(),
    }

    let report = service.generate_quick_report().await;
    assert_eq!(report.status, ReportStatus::Critical);
    assert_eq!(report.high_severity_alerts, 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_many_medium_alerts_are_warning() -> Result<()> {
    let client = Arc::new(MockDatabaseClient::with_rows(vec![ticket_row("T-1", "valid")]));
    let service = service();
    let mut events = service.subscribe();
    service.initialize(client.clone()).await?;
    let optimizer = service.optimizer().await?;

    client.set_delay(Some(Duration::from_millis(60)));
    for i in 0..6 {
        optimizer.get_ticket_by_id(&format!("T-{i}")).await?;
    }
    for _ in 0..6 {
        next_event(&mut events, |e| matches!(e, ServiceEvent::PerformanceAlert(_))).await?;
    }

    let report = service.generate_quick_report().await;
    assert_eq!(report.recent_alerts, 6);
    assert_eq!(report.status, ReportStatus::Warning);

    let detailed = service.get_detailed_report().await;
    assert_eq!(detailed.alert_breakdown.get("slow_query"), Some(&6));
    assert!(detailed.optimizer.is_some());
    assert!(detailed.service_health.initialized);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_emergency_optimization_continues_past_failures() -> Result<()> {
    let client = Arc::new(MockDatabaseClient::new());
    client.fail_when("CREATE INDEX", "lock timeout");
    let service = service();
    service.initialize(client.clone()).await?;
    client.clear_failures();
    client.fail_when("idx_tickets_qr_code", "lock timeout");

    let mut events = service.subscribe();
    let summary = service.trigger_emergency_optimization().await?;

    assert_eq!(summary.index_failures.len(), 1);
    assert_eq!(summary.index_failures[0].index, "idx_tickets_qr_code");
    assert_eq!(summary.indexes_applied.len(), FESTIVAL_INDEXES.len() - 1);
    assert!(summary.statistics_refreshed);

    assert!(matches!(
        next_event(&mut events, |e| matches!(e, ServiceEvent::DeepAnalysisCompleted(_))).await?,
        ServiceEvent::DeepAnalysisCompleted(_)
    ));

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_auto_reporting_publishes_reports() -> Result<()> {
    let service = Arc::new(PerformanceService::new(
        festival_dbmon::config::ServiceConfig {
            auto_reporting: true,
            report_interval_ms: 20,
            baseline_optimization: false,
            ..quiet_service_config()
        },
        OptimizerConfig::default(),
        Arc::new(DatabaseMonitor::new()),
    ));
    let mut events = service.subscribe();
    service.initialize(Arc::new(MockDatabaseClient::new())).await?;

    let event = next_event(&mut events, |e| matches!(e, ServiceEvent::PerformanceReport(_))).await?;
    assert!(matches!(event, ServiceEvent::PerformanceReport(r) if r.initialized));

    service.shutdown().await;
    Ok(())
}

fn container(client: Arc<MockDatabaseClient>, manager: Arc<MockConnectionManager>) -> Result<ObservabilityContainer> {
    let mut config = Config::default();
    config.health_monitor = fast_health_config();
    config.service = quiet_service_config();
    ObservabilityContainer::new(config, client, manager)
}

#[tokio::test]
async fn test_container_health_monitor_lifecycle() -> Result<()> {
    let c = container(
        Arc::new(MockDatabaseClient::new()),
        Arc::new(MockConnectionManager::new()),
    )?;

    let first = c.get_health_monitor(None).await?;
    let again = c.get_health_monitor(None).await?;
    assert!(Arc::ptr_eq(&first, &again));

    c.reset_health_monitor().await;
    let rebuilt = c.get_health_monitor(None).await?;
    assert!(!Arc::ptr_eq(&first, &rebuilt));
    assert!(Arc::ptr_eq(
        &c.get_database_monitor(),
        &c.get_database_monitor()
    ));

    c.shutdown().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_system_health_check() -> Result<()> {
    let client = Arc::new(MockDatabaseClient::new());
    let manager = Arc::new(MockConnectionManager::new());
    let c = container(client.clone(), manager.clone())?;

    c.query_optimizer().await?;
    let healthy = c.perform_system_health_check().await?;
    assert_eq!(healthy.status, HealthStatus::Healthy);
    assert_eq!(healthy.connection.status, HealthStatus::Healthy);
    assert!(healthy.performance.initialized);

    client.fail_when("SELECT 1", "connection refused");
    let down = c.perform_system_health_check().await?;
    assert_eq!(down.status, HealthStatus::Unavailable);
    assert!(serde_json::to_string(&down)?.contains("UNAVAILABLE"));

    c.shutdown().await;
    Ok(())
}
