pub mod config;
pub mod container;
pub mod database;
pub mod error;
pub mod monitoring;
pub mod performance;

pub use config::Config;
pub use container::{ObservabilityContainer, SystemHealthReport};
pub use error::{MonitorError, Result};

// Database ports
pub use database::{
    BatchMode, ConnectionManager, ConnectionState, DatabaseClient, PgDatabase, PoolHealthStatus,
    PoolStatistics, QueryResult, Row, Statement,
};

// Re-export monitoring types
pub use monitoring::{
    Alert, AlertSeverity, AlertType, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitState, ConnectionHealthMonitor, DatabaseMonitor, HealthCheckResult, HealthStatus,
    MetricsCollector,
};

// Re-export optimizer and service types
pub use performance::{
    classify_slow_query, OptimizerEvent, PerformanceService, QueryOptimizer, QueryOutcome,
    QueryType, QuickReport, ReportStatus, ServiceEvent, SlowQuerySeverity,
};
