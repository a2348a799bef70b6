use super::{
    BatchMode, ConnectionManager, ConnectionState, DatabaseClient, PoolHealthStatus,
    PoolStatistics, QueryResult, Row, Statement,
};
use crate::config::DatabaseConfig;
use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgPoolOptions};
use sqlx::query::{Query, QueryScalar};
use sqlx::{Connection, Postgres};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Consecutive acquire failures before the state machine reports the pool
/// as disconnected.
const DISCONNECT_AFTER_FAILURES: u32 = 3;
const FAILED_AFTER_FAILURES: u32 = 10;

/// `sqlx` backed implementation of both database ports.
///
/// Connection acquisition is timed on every call so the health monitor can
/// report acquisition percentiles; connection creation is counted through the
/// pool's `after_connect` hook.
pub struct PgDatabase {
    pool: PgPool,
    config: DatabaseConfig,
    connections_created: Arc<AtomicU64>,
    acquire_errors: AtomicU64,
    acquisition_samples: RwLock<VecDeque<f64>>,
    health: RwLock<PoolHealthStatus>,
}

impl PgDatabase {
    pub async fn connect(config: DatabaseConfig) -> Result<Self> {
        let connections_created = Arc::new(AtomicU64::new(0));
        let counter = connections_created.clone();

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_seconds)))
            .max_lifetime(Some(Duration::from_secs(config.max_lifetime_seconds)))
            .after_connect(move |_conn, _meta| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            })
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self {
            pool,
            config,
            connections_created,
            acquire_errors: AtomicU64::new(0),
            acquisition_samples: RwLock::new(VecDeque::new()),
            health: RwLock::new(PoolHealthStatus::default()),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Connection pool closed");
    }

    async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        let start = Instant::now();
        match self.pool.acquire().await {
            Ok(conn) => {
                self.record_acquisition(start.elapsed().as_secs_f64() * 1000.0)
                    .await;
                self.transition_on_success().await;
                Ok(conn)
            }
            Err(e) => {
                self.acquire_errors.fetch_add(1, Ordering::Relaxed);
                self.transition_on_failure(&e.to_string()).await;
                Err(MonitorError::Connectivity(format!(
                    "connection acquisition failed: {e}"
                )))
            }
        }
    }

    async fn record_acquisition(&self, elapsed_ms: f64) {
        let mut samples = self.acquisition_samples.write().await;
        samples.push_back(elapsed_ms);
        while samples.len() > self.config.acquisition_sample_size {
            samples.pop_front();
        }
    }

    async fn transition_on_success(&self) {
        let mut health = self.health.write().await;
        if health.state != ConnectionState::Connected {
            info!(from = %health.state, "Connection state recovered");
            health.state = ConnectionState::Connected;
            health.last_transition = Utc::now();
        }
        health.consecutive_failures = 0;
    }

    async fn transition_on_failure(&self, error: &str) {
        let mut health = self.health.write().await;
        health.consecutive_failures += 1;
        health.last_error = Some(error.to_string());

        let next = match health.consecutive_failures {
            n if n >= FAILED_AFTER_FAILURES => ConnectionState::Failed,
            n if n >= DISCONNECT_AFTER_FAILURES => ConnectionState::Disconnected,
            _ if health.state == ConnectionState::Connected => ConnectionState::Degraded,
            _ => ConnectionState::Reconnecting,
        };

        if next != health.state {
            warn!(
                from = %health.state,
                to = %next,
                failures = health.consecutive_failures,
                "Connection state changed"
            );
            health.state = next;
            health.last_transition = Utc::now();
        }
    }
}

async fn run_statement(conn: &mut PgConnection, statement: &Statement) -> Result<QueryResult> {
    if statement.returns_rows() {
        let wrapped = format!("SELECT to_jsonb(q) AS row FROM ({}) AS q", statement.sql);
        let query = bind_scalar(sqlx::query_scalar::<_, Value>(&wrapped), &statement.args);
        let values = query.fetch_all(&mut *conn).await?;

        let rows: Vec<Row> = values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        let rows_affected = rows.len() as u64;
        Ok(QueryResult {
            rows,
            rows_affected,
        })
    } else {
        let query = bind_query(sqlx::query(&statement.sql), &statement.args);
        let done = query.execute(&mut *conn).await?;
        Ok(QueryResult {
            rows: Vec::new(),
            rows_affected: done.rows_affected(),
        })
    }
}

fn bind_query<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
            Value::Number(n) => query.bind(n.as_f64()),
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(sqlx::types::Json(other.clone())),
        };
    }
    query
}

fn bind_scalar<'q>(
    mut query: QueryScalar<'q, Postgres, Value, PgArguments>,
    args: &[Value],
) -> QueryScalar<'q, Postgres, Value, PgArguments> {
    for arg in args {
        query = match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
            Value::Number(n) => query.bind(n.as_f64()),
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(sqlx::types::Json(other.clone())),
        };
    }
    query
}

#[async_trait]
impl DatabaseClient for PgDatabase {
    async fn execute(&self, statement: Statement) -> Result<QueryResult> {
        let mut conn = self.acquire().await?;
        run_statement(&mut conn, &statement).await
    }

    async fn batch(&self, statements: Vec<Statement>, mode: BatchMode) -> Result<Vec<QueryResult>> {
        let mut conn = self.acquire().await?;
        let mut results = Vec::with_capacity(statements.len());

        match mode {
            BatchMode::Read => {
                for statement in &statements {
                    results.push(run_statement(&mut conn, statement).await?);
                }
            }
            BatchMode::Write | BatchMode::Deferred => {
                let mut tx = conn.begin().await?;
                if mode == BatchMode::Deferred {
                    sqlx::query("SET CONSTRAINTS ALL DEFERRED")
                        .execute(&mut *tx)
                        .await?;
                }
                for statement in &statements {
                    results.push(run_statement(&mut tx, statement).await?);
                }
                tx.commit().await?;
            }
        }

        debug!(statements = statements.len(), ?mode, "Batch committed");
        Ok(results)
    }
}

#[async_trait]
impl ConnectionManager for PgDatabase {
    async fn pool_statistics(&self) -> Result<PoolStatistics> {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        let samples = self.acquisition_samples.read().await;

        Ok(PoolStatistics {
            max_connections: self.config.max_connections,
            active_leases: size.saturating_sub(idle),
            idle_connections: idle,
            total_connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_creation_errors: self.acquire_errors.load(Ordering::Relaxed),
            acquisition_times_ms: samples.iter().copied().collect(),
        })
    }

    async fn pool_health_status(&self) -> Result<PoolHealthStatus> {
        if self.pool.is_closed() {
            return Ok(PoolHealthStatus {
                state: ConnectionState::Disconnected,
                last_error: Some("pool closed".to_string()),
                ..self.health.read().await.clone()
            });
        }
        Ok(self.health.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The state machine is exercised without a live database by driving the
    // transition helpers directly.
    fn lazy_database() -> PgDatabase {
        let config = DatabaseConfig::default();
        PgDatabase {
            pool: PgPool::connect_lazy("postgresql://localhost/festival_test").unwrap(),
            config,
            connections_created: Arc::new(AtomicU64::new(0)),
            acquire_errors: AtomicU64::new(0),
            acquisition_samples: RwLock::new(VecDeque::new()),
            health: RwLock::new(PoolHealthStatus::default()),
        }
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let db = lazy_database();

        db.transition_on_failure("timeout").await;
        assert_eq!(db.health.read().await.state, ConnectionState::Degraded);

        db.transition_on_failure("timeout").await;
        assert_eq!(db.health.read().await.state, ConnectionState::Reconnecting);

        db.transition_on_failure("timeout").await;
        assert_eq!(db.health.read().await.state, ConnectionState::Disconnected);

        db.transition_on_success().await;
        let health = db.health.read().await.clone();
        assert_eq!(health.state, ConnectionState::Connected);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_acquisition_samples_bounded() {
        let db = lazy_database();
        let cap = db.config.acquisition_sample_size;
        for i in 0..(cap + 25) {
            db.record_acquisition(i as f64).await;
        }
        let stats = db.pool_statistics().await.unwrap();
        assert_eq!(stats.acquisition_times_ms.len(), cap);
        assert_eq!(stats.acquisition_times_ms[0], 25.0);
    }
}
