//! Query optimization and the performance service facade

pub mod cache;
pub mod metrics;
pub mod optimizer;
pub mod service;

pub use cache::{CacheOperationMetrics, QueryCache};
pub use metrics::{QueryTypeMetrics, QueryTypeTracker};
pub use optimizer::{
    DeepAnalysisReport, IndexCreationReport, OptimizerEvent, OptimizerMetrics, QueryOptimizer,
    QueryOutcome, QueryType, Recommendation, RecommendationKind, RecommendationPriority,
    FESTIVAL_INDEXES,
};
pub use service::{
    classify_slow_query, DetailedReport, EmergencyOptimizationSummary, PerformanceAlert,
    PerformanceAlertType, PerformanceService, QuickReport, ReportStatus, ServiceEvent,
    SlowQuerySeverity, TrackedClient,
};
