use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Circuit breaker is open - call rejected")]
    CircuitOpen,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Performance service not initialized")]
    NotInitialized,
}

impl MonitorError {
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// True when the database reported that the object being created is
    /// already present. Index creation treats this as success.
    pub fn is_already_exists(&self) -> bool {
        match self {
            MonitorError::Database(sqlx::Error::Database(db_err)) => {
                // 42P07 duplicate_table, 42710 duplicate_object
                matches!(db_err.code().as_deref(), Some("42P07") | Some("42710"))
                    || db_err.message().contains("already exists")
            }
            other => other.to_string().contains("already exists"),
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_exists_detection() {
        let err = MonitorError::query("relation \"idx_tickets_qr\" already exists");
        assert!(err.is_already_exists());

        let err = MonitorError::query("permission denied for table tickets");
        assert!(!err.is_already_exists());

        assert!(!MonitorError::CircuitOpen.is_already_exists());
    }

    #[test]
    fn test_error_display() {
        let err = MonitorError::Configuration("pool utilization warning >= critical".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: pool utilization warning >= critical"
        );
    }
}
