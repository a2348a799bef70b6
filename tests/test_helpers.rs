//! Shared test infrastructure: in-memory database client and connection
//! manager doubles plus test-friendly configuration.

#![allow(dead_code)]

use async_trait::async_trait;
use festival_dbmon::{
    config::{HealthMonitorConfig, OptimizerConfig, ServiceConfig},
    BatchMode, CircuitBreakerConfig, ConnectionManager, ConnectionState, DatabaseClient,
    MonitorError, PoolHealthStatus, PoolStatistics, QueryResult, Result, Row, Statement,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Database client double. Statements containing a registered pattern fail
/// with the registered message; everything else returns the configured rows.
#[derive(Default)]
pub struct MockDatabaseClient {
    calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, String)>>,
    rows: Mutex<Vec<Row>>,
    delay: Mutex<Option<Duration>>,
}

impl MockDatabaseClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Row>) -> Self {
        let client = Self::default();
        client.set_rows(rows);
        client
    }

    pub fn set_rows(&self, rows: Vec<Row>) {
        *self.rows.lock().unwrap() = rows;
    }

    /// Fail every statement whose SQL contains `pattern` (empty matches all).
    pub fn fail_when(&self, pattern: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), message.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_matching(&self, pattern: &str) -> usize {
        self.executed()
            .iter()
            .filter(|sql| sql.contains(pattern))
            .count()
    }

    fn failure_for(&self, sql: &str) -> Option<String> {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, message)| message.clone())
    }

    async fn run(&self, statement: &Statement) -> Result<QueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(statement.sql.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.failure_for(&statement.sql) {
            return Err(MonitorError::query(message));
        }

        let rows = self.rows.lock().unwrap().clone();
        Ok(QueryResult {
            rows_affected: rows.len() as u64,
            rows,
        })
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn execute(&self, statement: Statement) -> Result<QueryResult> {
        self.run(&statement).await
    }

    async fn batch(&self, statements: Vec<Statement>, _mode: BatchMode) -> Result<Vec<QueryResult>> {
        let mut results = Vec::with_capacity(statements.len());
        for statement in &statements {
            results.push(self.run(statement).await?);
        }
        Ok(results)
    }
}

/// Connection manager double with settable pool statistics and state.
pub struct MockConnectionManager {
    statistics: Mutex<PoolStatistics>,
    health: Mutex<PoolHealthStatus>,
    failing: AtomicBool,
}

impl Default for MockConnectionManager {
    fn default() -> Self {
        Self {
            statistics: Mutex::new(PoolStatistics {
                max_connections: 20,
                active_leases: 2,
                idle_connections: 8,
                total_connections_created: 10,
                connection_creation_errors: 0,
                acquisition_times_ms: vec![1.0, 2.0, 3.0, 4.0],
            }),
            health: Mutex::new(PoolHealthStatus::default()),
            failing: AtomicBool::new(false),
        }
    }
}

impl MockConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `active` of 20 connections.
    pub fn set_active_leases(&self, active: u32) {
        self.statistics.lock().unwrap().active_leases = active;
    }

    pub fn set_statistics(&self, statistics: PoolStatistics) {
        *self.statistics.lock().unwrap() = statistics;
    }

    pub fn set_state(&self, state: ConnectionState, consecutive_failures: u32) {
        let mut health = self.health.lock().unwrap();
        health.state = state;
        health.consecutive_failures = consecutive_failures;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionManager for MockConnectionManager {
    async fn pool_statistics(&self) -> Result<PoolStatistics> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MonitorError::Connectivity("pool unavailable".into()));
        }
        Ok(self.statistics.lock().unwrap().clone())
    }

    async fn pool_health_status(&self) -> Result<PoolHealthStatus> {
        Ok(self.health.lock().unwrap().clone())
    }
}

pub fn ticket_row(ticket_id: &str, status: &str) -> Row {
    let mut row = Row::new();
    row.insert("ticket_id".into(), json!(ticket_id));
    row.insert("status".into(), json!(status));
    row.insert("price_paid".into(), json!(45.0));
    row
}

pub fn fast_health_config() -> HealthMonitorConfig {
    HealthMonitorConfig {
        check_interval_ms: 20,
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 60_000,
            failure_window_ms: 60_000,
        },
        ..HealthMonitorConfig::default()
    }
}

/// Breaker that opens on the first failure and retries after 50ms.
pub fn quick_recovery_health_config() -> HealthMonitorConfig {
    HealthMonitorConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 50,
            failure_window_ms: 60_000,
        },
        ..fast_health_config()
    }
}

pub fn short_ttl_optimizer_config(ttl_ms: u64) -> OptimizerConfig {
    OptimizerConfig {
        cache_ttl_ms: ttl_ms,
        ..OptimizerConfig::default()
    }
}

pub fn quiet_service_config() -> ServiceConfig {
    ServiceConfig {
        auto_reporting: false,
        ..ServiceConfig::default()
    }
}
