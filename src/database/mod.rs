//! Database ports consumed by the monitors and the optimizer.
//!
//! The subsystem never owns the connection pool. It talks to the database
//! through [`DatabaseClient`] and reads pool state through
//! [`ConnectionManager`]; [`postgres::PgDatabase`] implements both on top of
//! an `sqlx` pool.

pub mod postgres;

pub use postgres::PgDatabase;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Parameterized SQL statement. Positional arguments bind to `$1..$n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Whether the statement produces rows rather than just an affected count.
    pub fn returns_rows(&self) -> bool {
        let head = self.sql.trim_start().to_ascii_uppercase();
        head.starts_with("SELECT") || head.starts_with("WITH") || head.starts_with("VALUES")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// Transaction semantics for [`DatabaseClient::batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// All statements in one read-write transaction.
    Write,
    /// Statements run one after another without a transaction.
    Read,
    /// One transaction, constraint checks deferred to commit.
    Deferred,
}

#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn execute(&self, statement: Statement) -> Result<QueryResult>;

    async fn batch(&self, statements: Vec<Statement>, mode: BatchMode) -> Result<Vec<QueryResult>>;
}

/// Point-in-time view of the externally owned connection pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub max_connections: u32,
    pub active_leases: u32,
    pub idle_connections: u32,
    pub total_connections_created: u64,
    pub connection_creation_errors: u64,
    /// Recent connection acquisition latencies, oldest first.
    pub acquisition_times_ms: Vec<f64>,
}

impl PoolStatistics {
    pub fn utilization_percentage(&self) -> f64 {
        if self.max_connections == 0 {
            return 0.0;
        }
        (self.active_leases as f64 / self.max_connections as f64) * 100.0
    }

    pub fn error_rate_percentage(&self) -> f64 {
        if self.total_connections_created == 0 {
            // Errors with nothing ever created means every attempt failed.
            return if self.connection_creation_errors > 0 {
                100.0
            } else {
                0.0
            };
        }
        (self.connection_creation_errors as f64 / self.total_connections_created as f64) * 100.0
    }
}

/// States of the pool's connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Degraded,
    Reconnecting,
    Disconnected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthStatus {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_transition: DateTime<Utc>,
}

impl Default for PoolHealthStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connected,
            consecutive_failures: 0,
            last_error: None,
            last_transition: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn pool_statistics(&self) -> Result<PoolStatistics>;

    async fn pool_health_status(&self) -> Result<PoolHealthStatus>;
}
