//! Ticketing query optimizer.
//!
//! Wraps the hot ticketing queries with a TTL cache and per-type metrics,
//! creates the indexes those queries rely on, and publishes slow-query and
//! error events to subscribers.

use super::cache::{CacheOperationMetrics, QueryCache};
use super::metrics::{QueryTypeMetrics, QueryTypeTracker};
use crate::config::OptimizerConfig;
use crate::database::{BatchMode, DatabaseClient, QueryResult, Statement};
use crate::error::Result;
use crate::monitoring::{DatabaseMonitor, MetricsCollector};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    TicketById,
    QrValidation,
    TicketsByEmail,
    EventStatistics,
    DailySalesReport,
    CheckInDashboard,
    RevenueBreakdown,
    HourlySalesPattern,
    RepeatCustomerAnalytics,
}

impl QueryType {
    pub const ALL: [QueryType; 9] = [
        QueryType::TicketById,
        QueryType::QrValidation,
        QueryType::TicketsByEmail,
        QueryType::EventStatistics,
        QueryType::DailySalesReport,
        QueryType::CheckInDashboard,
        QueryType::RevenueBreakdown,
        QueryType::HourlySalesPattern,
        QueryType::RepeatCustomerAnalytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::TicketById => "ticket_by_id",
            QueryType::QrValidation => "qr_validation",
            QueryType::TicketsByEmail => "tickets_by_email",
            QueryType::EventStatistics => "event_statistics",
            QueryType::DailySalesReport => "daily_sales_report",
            QueryType::CheckInDashboard => "check_in_dashboard",
            QueryType::RevenueBreakdown => "revenue_breakdown",
            QueryType::HourlySalesPattern => "hourly_sales_pattern",
            QueryType::RepeatCustomerAnalytics => "repeat_customer_analytics",
        }
    }

    /// QR validation must always reflect the current ticket state, so a
    /// used or revoked ticket can never be replayed from cache.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, QueryType::QrValidation)
    }

    pub fn supporting_indexes(&self) -> &'static [&'static str] {
        match self {
            QueryType::TicketById => &["idx_tickets_ticket_id", "idx_tickets_order_id"],
            QueryType::QrValidation => &["idx_tickets_qr_code"],
            QueryType::TicketsByEmail => &["idx_orders_customer_email", "idx_tickets_order_id"],
            QueryType::EventStatistics => &["idx_tickets_event_status"],
            QueryType::DailySalesReport => &["idx_orders_created_at", "idx_tickets_order_id"],
            QueryType::CheckInDashboard => &["idx_tickets_event_checked_in", "idx_tickets_event_status"],
            QueryType::RevenueBreakdown => &["idx_orders_created_at", "idx_tickets_event_status"],
            QueryType::HourlySalesPattern => &["idx_orders_created_at"],
            QueryType::RepeatCustomerAnalytics => &["idx_orders_customer_email"],
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexDefinition {
    pub name: &'static str,
    pub table: &'static str,
    pub sql: &'static str,
}

pub const FESTIVAL_INDEXES: &[IndexDefinition] = &[
    IndexDefinition {
        name: "idx_tickets_ticket_id",
        table: "tickets",
        sql: "CREATE INDEX IF NOT EXISTS idx_tickets_ticket_id ON tickets (ticket_id)",
    },
    IndexDefinition {
        name: "idx_tickets_qr_code",
        table: "tickets",
        sql: "CREATE INDEX IF NOT EXISTS idx_tickets_qr_code ON tickets (qr_code)",
    },
    IndexDefinition {
        name: "idx_tickets_order_id",
        table: "tickets",
        sql: "CREATE INDEX IF NOT EXISTS idx_tickets_order_id ON tickets (order_id)",
    },
    IndexDefinition {
        name: "idx_tickets_event_status",
        table: "tickets",
        sql: "CREATE INDEX IF NOT EXISTS idx_tickets_event_status ON tickets (event_id, status)",
    },
    IndexDefinition {
        name: "idx_tickets_event_checked_in",
        table: "tickets",
        sql: "CREATE INDEX IF NOT EXISTS idx_tickets_event_checked_in ON tickets (event_id, checked_in_at) WHERE checked_in_at IS NOT NULL",
    },
    IndexDefinition {
        name: "idx_orders_customer_email",
        table: "orders",
        sql: "CREATE INDEX IF NOT EXISTS idx_orders_customer_email ON orders (lower(customer_email))",
    },
    IndexDefinition {
        name: "idx_orders_created_at",
        table: "orders",
        sql: "CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders (created_at)",
    },
];

const STATISTICS_TABLES: &[&str] = &["tickets", "orders", "events"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub data: Value,
    pub query_type: QueryType,
    pub execution_time_ms: f64,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OptimizerEvent {
    SlowQuery {
        query_type: QueryType,
        execution_time_ms: f64,
        threshold_ms: f64,
    },
    PerformanceDegradation {
        query_type: QueryType,
        avg_time_ms: f64,
        executions: u64,
    },
    DeepAnalysis(DeepAnalysisReport),
    QueryError {
        query_type: QueryType,
        execution_time_ms: f64,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationKind {
    SlowQuery,
    LowCacheEfficiency,
    MissingIndexes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: RecommendationPriority,
    pub query_type: Option<QueryType>,
    pub message: String,
    pub suggested_indexes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFailure {
    pub index: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexCreationReport {
    pub created: Vec<String>,
    pub already_present: Vec<String>,
    pub errors: Vec<IndexFailure>,
    pub indexes_created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEfficiency {
    pub entries: usize,
    pub max_entries: usize,
    pub estimated_bytes: usize,
    pub operations: CacheOperationMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepAnalysisReport {
    pub timestamp: DateTime<Utc>,
    pub query_types: Vec<QueryTypeMetrics>,
    pub slowest: Vec<QueryTypeMetrics>,
    pub cache: CacheEfficiency,
    pub recommendations: Vec<Recommendation>,
    pub indexes_created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerMetrics {
    pub query_types: BTreeMap<String, QueryTypeMetrics>,
    pub cache: CacheEfficiency,
    pub indexes_created: bool,
    pub created_indexes: Vec<String>,
}

enum Shape {
    /// First row as an object, or null when nothing matched
    Single,
    Rows,
}

pub struct QueryOptimizer {
    client: Arc<dyn DatabaseClient>,
    database_monitor: Arc<DatabaseMonitor>,
    config: OptimizerConfig,
    cache: QueryCache,
    trackers: RwLock<HashMap<QueryType, QueryTypeTracker>>,
    indexes_created: AtomicBool,
    created_indexes: RwLock<HashSet<String>>,
    events: broadcast::Sender<OptimizerEvent>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl QueryOptimizer {
    pub fn new(
        client: Arc<dyn DatabaseClient>,
        database_monitor: Arc<DatabaseMonitor>,
        config: OptimizerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(1000);
        let cache = QueryCache::new(config.cache_ttl(), config.max_cache_size);

        Ok(Self {
            client,
            database_monitor,
            config,
            cache,
            trackers: RwLock::new(HashMap::new()),
            indexes_created: AtomicBool::new(false),
            created_indexes: RwLock::new(HashSet::new()),
            events,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OptimizerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn indexes_created(&self) -> bool {
        self.indexes_created.load(Ordering::SeqCst)
    }

    fn publish(&self, event: OptimizerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub async fn get_ticket_by_id(&self, ticket_id: &str) -> Result<QueryOutcome> {
        let statement = Statement::with_args(
            r#"SELECT t.id, t.ticket_id, t.qr_code, t.status, t.ticket_type, t.price_paid,
                      t.checked_in_at, t.created_at,
                      o.customer_email, o.customer_name,
                      e.name AS event_name, e.event_date, e.venue
               FROM tickets t
               JOIN orders o ON o.id = t.order_id
               JOIN events e ON e.id = t.event_id
               WHERE t.ticket_id = $1
               LIMIT 1"#,
            vec![json!(ticket_id)],
        );
        self.run(
            QueryType::TicketById,
            json!({ "ticket_id": ticket_id }),
            statement,
            Shape::Single,
        )
        .await
    }

    /// Never cached.
    pub async fn validate_qr_code(&self, qr_code: &str) -> Result<QueryOutcome> {
        let statement = Statement::with_args(
            r#"SELECT t.ticket_id, t.status, t.ticket_type, t.checked_in_at,
                      e.id AS event_id, e.name AS event_name, e.event_date,
                      (t.status = 'valid' AND t.checked_in_at IS NULL) AS is_valid
               FROM tickets t
               JOIN events e ON e.id = t.event_id
               WHERE t.qr_code = $1
               LIMIT 1"#,
            vec![json!(qr_code)],
        );
        self.run(
            QueryType::QrValidation,
            json!({ "qr_code": qr_code }),
            statement,
            Shape::Single,
        )
        .await
    }

    pub async fn get_tickets_by_email(&self, email: &str, limit: u32) -> Result<QueryOutcome> {
        let email = email.trim().to_lowercase();
        let statement = Statement::with_args(
            r#"SELECT t.ticket_id, t.status, t.ticket_type, t.price_paid, t.checked_in_at,
                      o.id AS order_id, o.created_at AS ordered_at,
                      e.name AS event_name, e.event_date, e.venue
               FROM orders o
               JOIN tickets t ON t.order_id = o.id
               JOIN events e ON e.id = t.event_id
               WHERE lower(o.customer_email) = $1
               ORDER BY o.created_at DESC
               LIMIT $2"#,
            vec![json!(email), json!(limit)],
        );
        self.run(
            QueryType::TicketsByEmail,
            json!({ "email": email, "limit": limit }),
            statement,
            Shape::Rows,
        )
        .await
    }

    pub async fn get_event_statistics(&self, event_id: Uuid) -> Result<QueryOutcome> {
        let statement = Statement::with_args(
            r#"SELECT COUNT(*) AS total_tickets,
                      COUNT(*) FILTER (WHERE t.status = 'valid') AS valid_tickets,
                      COUNT(*) FILTER (WHERE t.status = 'cancelled') AS cancelled_tickets,
                      COUNT(t.checked_in_at) AS checked_in,
                      COALESCE(SUM(t.price_paid), 0) AS revenue,
                      COUNT(DISTINCT t.order_id) AS orders
               FROM tickets t
               WHERE t.event_id = $1::uuid"#,
            vec![json!(event_id)],
        );
        self.run(
            QueryType::EventStatistics,
            json!({ "event_id": event_id }),
            statement,
            Shape::Single,
        )
        .await
    }

    pub async fn get_daily_sales_report(&self, date: NaiveDate) -> Result<QueryOutcome> {
        let statement = Statement::with_args(
            r#"SELECT t.ticket_type,
                      COUNT(*) AS tickets_sold,
                      COUNT(DISTINCT o.id) AS orders,
                      COALESCE(SUM(t.price_paid), 0) AS revenue
               FROM orders o
               JOIN tickets t ON t.order_id = o.id
               WHERE o.created_at >= $1::date
                 AND o.created_at < $1::date + INTERVAL '1 day'
               GROUP BY t.ticket_type
               ORDER BY revenue DESC"#,
            vec![json!(date)],
        );
        self.run(
            QueryType::DailySalesReport,
            json!({ "date": date }),
            statement,
            Shape::Rows,
        )
        .await
    }

    pub async fn get_check_in_dashboard(&self, event_id: Uuid) -> Result<QueryOutcome> {
        let statement = Statement::with_args(
            r#"SELECT t.ticket_type,
                      COUNT(*) AS total,
                      COUNT(t.checked_in_at) AS checked_in,
                      COUNT(*) FILTER (WHERE t.checked_in_at >= NOW() - INTERVAL '1 hour') AS last_hour,
                      MAX(t.checked_in_at) AS last_check_in
               FROM tickets t
               WHERE t.event_id = $1::uuid AND t.status <> 'cancelled'
               GROUP BY t.ticket_type
               ORDER BY t.ticket_type"#,
            vec![json!(event_id)],
        );
        self.run(
            QueryType::CheckInDashboard,
            json!({ "event_id": event_id }),
            statement,
            Shape::Rows,
        )
        .await
    }

    /// Revenue by day and ticket type over `[start, end]`, optionally for one event.
    pub async fn get_revenue_breakdown(
        &self,
        event_id: Option<Uuid>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<QueryOutcome> {
        let statement = Statement::with_args(
            r#"SELECT date_trunc('day', o.created_at)::date AS day,
                      t.ticket_type,
                      COUNT(*) AS tickets,
                      COALESCE(SUM(t.price_paid), 0) AS revenue
               FROM orders o
               JOIN tickets t ON t.order_id = o.id
               WHERE o.created_at >= $1::date
                 AND o.created_at < $2::date + INTERVAL '1 day'
                 AND ($3::uuid IS NULL OR t.event_id = $3::uuid)
               GROUP BY day, t.ticket_type
               ORDER BY day, t.ticket_type"#,
            vec![json!(start), json!(end), json!(event_id)],
        );
        self.run(
            QueryType::RevenueBreakdown,
            json!({ "event_id": event_id, "start": start, "end": end }),
            statement,
            Shape::Rows,
        )
        .await
    }

    pub async fn get_hourly_sales_pattern(&self, days: u32) -> Result<QueryOutcome> {
        let statement = Statement::with_args(
            r#"SELECT EXTRACT(HOUR FROM o.created_at)::int AS hour,
                      COUNT(DISTINCT o.id) AS orders,
                      COALESCE(SUM(o.amount), 0) AS revenue
               FROM orders o
               WHERE o.created_at >= NOW() - make_interval(days => $1::int)
               GROUP BY hour
               ORDER BY hour"#,
            vec![json!(days)],
        );
        self.run(
            QueryType::HourlySalesPattern,
            json!({ "days": days }),
            statement,
            Shape::Rows,
        )
        .await
    }

    pub async fn get_repeat_customer_analytics(&self, min_orders: u32) -> Result<QueryOutcome> {
        let statement = Statement::with_args(
            r#"SELECT lower(o.customer_email) AS customer_email,
                      COUNT(*) AS orders,
                      COALESCE(SUM(o.amount), 0) AS lifetime_value,
                      MIN(o.created_at) AS first_order,
                      MAX(o.created_at) AS last_order
               FROM orders o
               GROUP BY lower(o.customer_email)
               HAVING COUNT(*) >= $1
               ORDER BY lifetime_value DESC
               LIMIT 100"#,
            vec![json!(min_orders)],
        );
        self.run(
            QueryType::RepeatCustomerAnalytics,
            json!({ "min_orders": min_orders }),
            statement,
            Shape::Rows,
        )
        .await
    }

    async fn run(
        &self,
        query_type: QueryType,
        args: Value,
        statement: Statement,
        shape: Shape,
    ) -> Result<QueryOutcome> {
        let start = Instant::now();
        let cache_key = query_type
            .is_cacheable()
            .then(|| QueryCache::cache_key(query_type.as_str(), &args));

        if let Some(key) = &cache_key {
            let cached = self.cache.get(key).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_lookup(query_type.as_str(), cached.is_some());
            }
            if let Some(data) = cached {
                self.trackers
                    .write()
                    .await
                    .entry(query_type)
                    .or_default()
                    .record_cache_hit();
                debug!(query_type = %query_type, "Query served from cache");
                return Ok(QueryOutcome {
                    data,
                    query_type,
                    execution_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                    from_cache: true,
                });
            }
        }

        let outcome = self.client.execute(statement).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let message = e.to_string();
                error!(
                    query_type = %query_type,
                    elapsed_ms,
                    error = %message,
                    "Optimized query failed"
                );
                self.database_monitor
                    .record_query(elapsed_ms, Some(&message))
                    .await;
                self.trackers
                    .write()
                    .await
                    .entry(query_type)
                    .or_default()
                    .record_error();
                if let Some(metrics) = &self.metrics {
                    metrics.record_query(query_type.as_str(), elapsed_ms, false);
                }
                self.publish(OptimizerEvent::QueryError {
                    query_type,
                    execution_time_ms: elapsed_ms,
                    error: message,
                });
                return Err(e);
            }
        };

        self.database_monitor.record_query(elapsed_ms, None).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_query(query_type.as_str(), elapsed_ms, true);
        }

        let row_count = result.rows.len();
        let data = shape_rows(result, shape);

        let degradation = {
            let mut trackers = self.trackers.write().await;
            let tracker = trackers.entry(query_type).or_default();
            tracker.record_execution(elapsed_ms, row_count);
            tracker
                .check_degradation(
                    self.config.degradation_threshold_ms,
                    self.config.degradation_min_samples,
                )
                .then(|| (tracker.avg_time_ms(), tracker.executions()))
        };

        if elapsed_ms > self.config.slow_query_threshold_ms {
            warn!(
                query_type = %query_type,
                elapsed_ms,
                threshold_ms = self.config.slow_query_threshold_ms,
                "Slow query detected"
            );
            self.publish(OptimizerEvent::SlowQuery {
                query_type,
                execution_time_ms: elapsed_ms,
                threshold_ms: self.config.slow_query_threshold_ms,
            });
        }

        if let Some((avg_time_ms, executions)) = degradation {
            warn!(query_type = %query_type, avg_time_ms, executions, "Query performance degraded");
            self.publish(OptimizerEvent::PerformanceDegradation {
                query_type,
                avg_time_ms,
                executions,
            });
        }

        if let Some(key) = cache_key {
            self.cache.insert(key, data.clone()).await;
            if let Some(metrics) = &self.metrics {
                metrics.set_cache_entries(self.cache.len().await);
            }
        }

        Ok(QueryOutcome {
            data,
            query_type,
            execution_time_ms: elapsed_ms,
            from_cache: false,
        })
    }

    /// Create every festival index. "Already exists" failures count as success.
    pub async fn create_festival_indexes(&self) -> IndexCreationReport {
        let mut report = IndexCreationReport::default();

        for index in FESTIVAL_INDEXES {
            match self.client.execute(Statement::new(index.sql)).await {
                Ok(_) => {
                    debug!(index = index.name, table = index.table, "Index ensured");
                    report.created.push(index.name.to_string());
                }
                Err(e) if e.is_already_exists() => {
                    debug!(index = index.name, "Index already exists");
                    report.already_present.push(index.name.to_string());
                }
                Err(e) => {
                    warn!(index = index.name, error = %e, "Failed to create index");
                    report.errors.push(IndexFailure {
                        index: index.name.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let succeeded: Vec<String> = report
            .created
            .iter()
            .chain(report.already_present.iter())
            .cloned()
            .collect();
        if !succeeded.is_empty() {
            self.created_indexes.write().await.extend(succeeded);
            self.indexes_created.store(true, Ordering::SeqCst);
        }
        report.indexes_created = self.indexes_created();

        info!(
            created = report.created.len(),
            already_present = report.already_present.len(),
            errors = report.errors.len(),
            "Festival index creation finished"
        );
        report
    }

    /// Create a single named festival index.
    pub async fn create_index(&self, name: &str) -> Result<()> {
        let index = FESTIVAL_INDEXES
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| crate::error::MonitorError::query(format!("Unknown index: {name}")))?;

        match self.client.execute(Statement::new(index.sql)).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        self.created_indexes.write().await.insert(name.to_string());
        Ok(())
    }

    /// Run `ANALYZE` on the ticketing tables.
    pub async fn refresh_statistics(&self) -> Result<()> {
        let statements = STATISTICS_TABLES
            .iter()
            .map(|table| Statement::new(format!("ANALYZE {table}")))
            .collect();
        self.client.batch(statements, BatchMode::Read).await?;
        info!(tables = STATISTICS_TABLES.len(), "Table statistics refreshed");
        Ok(())
    }

    pub async fn get_festival_recommendations(&self) -> Vec<Recommendation> {
        let snapshots = self.snapshots().await;
        let created = self.created_indexes.read().await.clone();
        let mut recommendations = Vec::new();

        for (query_type, metrics) in &snapshots {
            if metrics.executions > 0 && metrics.avg_time_ms > self.config.recommendation_slow_avg_ms {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::SlowQuery,
                    priority: if metrics.avg_time_ms > self.config.recommendation_slow_avg_ms * 2.0 {
                        RecommendationPriority::High
                    } else {
                        RecommendationPriority::Medium
                    },
                    query_type: Some(*query_type),
                    message: format!(
                        "{query_type} averages {:.1}ms over {} executions",
                        metrics.avg_time_ms, metrics.executions
                    ),
                    suggested_indexes: query_type
                        .supporting_indexes()
                        .iter()
                        .filter(|name| !created.contains(**name))
                        .map(|name| name.to_string())
                        .collect(),
                });
            }

            if query_type.is_cacheable()
                && metrics.lookups() >= self.config.low_cache_min_samples
                && metrics.cache_hit_rate < self.config.low_cache_hit_rate
            {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::LowCacheEfficiency,
                    priority: RecommendationPriority::Low,
                    query_type: Some(*query_type),
                    message: format!(
                        "{query_type} cache hit rate is {:.1}% over {} lookups",
                        metrics.cache_hit_rate,
                        metrics.lookups()
                    ),
                    suggested_indexes: Vec::new(),
                });
            }
        }

        if !self.indexes_created() {
            recommendations.push(Recommendation {
                kind: RecommendationKind::MissingIndexes,
                priority: RecommendationPriority::High,
                query_type: None,
                message: "Festival indexes have not been created".to_string(),
                suggested_indexes: FESTIVAL_INDEXES
                    .iter()
                    .filter(|i| !created.contains(i.name))
                    .map(|i| i.name.to_string())
                    .collect(),
            });
        }

        recommendations
    }

    async fn snapshots(&self) -> BTreeMap<QueryType, QueryTypeMetrics> {
        self.trackers
            .read()
            .await
            .iter()
            .map(|(query_type, tracker)| (*query_type, tracker.snapshot(query_type.as_str())))
            .collect()
    }

    async fn cache_efficiency(&self) -> CacheEfficiency {
        CacheEfficiency {
            entries: self.cache.len().await,
            max_entries: self.cache.max_entries(),
            estimated_bytes: self.cache.estimated_bytes().await,
            operations: self.cache.get_metrics().await,
        }
    }

    pub async fn perform_deep_analysis(&self) -> DeepAnalysisReport {
        let expired = self.cache.sweep().await;
        let query_types: Vec<QueryTypeMetrics> = self.snapshots().await.into_values().collect();

        let mut slowest: Vec<QueryTypeMetrics> = query_types
            .iter()
            .filter(|m| m.executions > 0)
            .cloned()
            .collect();
        slowest.sort_by(|a, b| b.avg_time_ms.total_cmp(&a.avg_time_ms));
        slowest.truncate(3);

        let report = DeepAnalysisReport {
            timestamp: Utc::now(),
            query_types,
            slowest,
            cache: self.cache_efficiency().await,
            recommendations: self.get_festival_recommendations().await,
            indexes_created: self.indexes_created(),
        };

        info!(
            query_types = report.query_types.len(),
            recommendations = report.recommendations.len(),
            swept_entries = expired,
            "Deep analysis completed"
        );
        self.publish(OptimizerEvent::DeepAnalysis(report.clone()));
        report
    }

    pub async fn clear_cache(&self) -> usize {
        let cleared = self.cache.clear().await;
        if let Some(metrics) = &self.metrics {
            metrics.set_cache_entries(0);
        }
        info!(cleared, "Query cache cleared");
        cleared
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.len().await
    }

    pub async fn get_performance_metrics(&self) -> OptimizerMetrics {
        let mut created_indexes: Vec<String> =
            self.created_indexes.read().await.iter().cloned().collect();
        created_indexes.sort();

        OptimizerMetrics {
            query_types: self
                .snapshots()
                .await
                .into_iter()
                .map(|(query_type, metrics)| (query_type.as_str().to_string(), metrics))
                .collect(),
            cache: self.cache_efficiency().await,
            indexes_created: self.indexes_created(),
            created_indexes,
        }
    }

    /// Approximate heap held by cached results.
    pub async fn estimated_memory_bytes(&self) -> usize {
        self.cache.estimated_bytes().await
    }
}

fn shape_rows(result: QueryResult, shape: Shape) -> Value {
    match shape {
        Shape::Single => result
            .rows
            .into_iter()
            .next()
            .map(Value::Object)
            .unwrap_or(Value::Null),
        Shape::Rows => Value::Array(result.rows.into_iter().map(Value::Object).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Row;
    use crate::error::MonitorError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingClient {
        calls: AtomicUsize,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl DatabaseClient for CountingClient {
        async fn execute(&self, _statement: Statement) -> Result<QueryResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.fail_with {
                return Err(MonitorError::query(message.clone()));
            }
            let mut row = Row::new();
            row.insert("status".into(), json!("valid"));
            Ok(QueryResult {
                rows: vec![row],
                rows_affected: 0,
            })
        }

        async fn batch(&self, statements: Vec<Statement>, _mode: BatchMode) -> Result<Vec<QueryResult>> {
            Ok(vec![QueryResult::default(); statements.len()])
        }
    }

    fn optimizer(client: Arc<CountingClient>) -> QueryOptimizer {
        QueryOptimizer::new(client, Arc::new(DatabaseMonitor::new()), OptimizerConfig::default())
            .unwrap()
    }

    #[test]
    fn test_only_qr_validation_is_uncached() {
        let uncached: Vec<_> = QueryType::ALL
            .iter()
            .filter(|q| !q.is_cacheable())
            .collect();
        assert_eq!(uncached, vec![&QueryType::QrValidation]);
    }

    #[test]
    fn test_supporting_indexes_exist() {
        for query_type in QueryType::ALL {
            for name in query_type.supporting_indexes() {
                assert!(FESTIVAL_INDEXES.iter().any(|i| i.name == *name), "{name}");
            }
        }
    }

    #[tokio::test]
    async fn test_cached_lookup_skips_database() {
        let client = Arc::new(CountingClient::default());
        let optimizer = optimizer(client.clone());

        let first = optimizer.get_ticket_by_id("T-1").await.unwrap();
        let second = optimizer.get_ticket_by_id("T-1").await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.data, second.data);
        assert_eq!(first.data["status"], "valid");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        let metrics = optimizer.get_performance_metrics().await;
        let ticket = &metrics.query_types["ticket_by_id"];
        assert_eq!(ticket.executions, 1);
        assert_eq!(ticket.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        let client = Arc::new(CountingClient {
            fail_with: Some("relation \"tickets\" does not exist".into()),
            ..Default::default()
        });
        let optimizer = optimizer(client);
        let mut events = optimizer.subscribe();

        let err = optimizer.get_event_statistics(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Query failed: relation \"tickets\" does not exist"
        );
        assert_eq!(optimizer.cache_size().await, 0);

        match events.recv().await.unwrap() {
            OptimizerEvent::QueryError { query_type, .. } => {
                assert_eq!(query_type, QueryType::EventStatistics)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_indexes_recommended_until_created() {
        let client = Arc::new(CountingClient::default());
        let optimizer = optimizer(client);

        let recs = optimizer.get_festival_recommendations().await;
        assert!(recs.iter().any(|r| r.kind == RecommendationKind::MissingIndexes));

        let report = optimizer.create_festival_indexes().await;
        assert_eq!(report.created.len(), FESTIVAL_INDEXES.len());
        assert!(report.indexes_created);

        let recs = optimizer.get_festival_recommendations().await;
        assert!(recs.iter().all(|r| r.kind != RecommendationKind::MissingIndexes));
    }

    #[tokio::test]
    async fn test_deep_analysis_publishes_event() {
        let optimizer = optimizer(Arc::new(CountingClient::default()));
        let mut events = optimizer.subscribe();
        optimizer.get_hourly_sales_pattern(7).await.unwrap();

        let report = optimizer.perform_deep_analysis().await;
        assert_eq!(report.query_types.len(), 1);
        assert_eq!(report.cache.entries, 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            OptimizerEvent::DeepAnalysis(_)
        ));
    }
}
