//! Error types for the Engram persistence layer
//!
//! Errors are grouped into three families that callers can route on:
//! user errors (bad input, unknown ids), third-party errors (the backend
//! driver), and system errors (invariant violations, malformed stored data).
//! Driver errors are wrapped exactly once with a stable
//! `(backend, operation, reason)` identity; structured errors already carrying
//! that identity are re-thrown unchanged rather than double-wrapped.

use thiserror::Error;

/// Main error type for Engram operations
#[derive(Error, Debug)]
pub enum EngramError {
    /// Backend driver failure, wrapped with the operation that issued it
    #[error("Database error in {backend}.{operation}: {source}{}", detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Database {
        /// Stable backend identifier (always `"postgres"` for this crate)
        backend: &'static str,
        /// The store operation that was executing, e.g. `"datasets.add_item"`
        operation: &'static str,
        #[source]
        source: sqlx::Error,
        /// Contextual detail such as an entity id; never credentials
        detail: Option<String>,
    },

    /// Requested entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Caller supplied invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A storage invariant no longer holds (corrupt or inconsistent state)
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Stored JSON did not parse into its expected shape
    #[error("Malformed stored data: {0}")]
    MalformedData(#[from] serde_json::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type alias for Engram operations
pub type Result<T> = std::result::Result<T, EngramError>;

impl EngramError {
    /// Wrap a driver error with its originating operation.
    ///
    /// Intended for `map_err(EngramError::db("threads.create_thread"))`.
    pub fn db(operation: &'static str) -> impl FnOnce(sqlx::Error) -> EngramError {
        move |source| EngramError::Database {
            backend: "postgres",
            operation,
            source,
            detail: None,
        }
    }

    /// Wrap a driver error with its operation plus an entity id for context.
    pub fn db_with(
        operation: &'static str,
        detail: impl Into<String>,
    ) -> impl FnOnce(sqlx::Error) -> EngramError {
        let detail = detail.into();
        move |source| EngramError::Database {
            backend: "postgres",
            operation,
            source,
            detail: Some(detail),
        }
    }

    /// True for errors caused by caller input rather than the system
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            EngramError::NotFound { .. } | EngramError::InvalidInput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = EngramError::NotFound {
            entity: "dataset",
            id: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "dataset not found: abc-123");
        assert!(err.is_user_error());
    }

    #[test]
    fn test_database_display_includes_operation() {
        let err = EngramError::db_with("threads.get_thread", "thread t-1")(
            sqlx::Error::RowNotFound,
        );
        let msg = err.to_string();
        assert!(msg.contains("postgres.threads.get_thread"), "{msg}");
        assert!(msg.contains("thread t-1"), "{msg}");
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_serde_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: EngramError = parse_err.into();
        assert!(matches!(err, EngramError::MalformedData(_)));
    }
}
