//! Database error types

use thiserror::Error;

/// Database errors
#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }

    pub fn serialization(err: impl ToString) -> Self {
        Self::Serialization(err.to_string())
    }

    /// Connection resets, refusals and timeouts are worth retrying.
    /// Validation, not-found and constraint violations are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Connection(_) | DbError::Timeout(_))
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DbError::Connection("reset".into()).is_transient());
        assert!(DbError::Timeout("slow".into()).is_transient());
        assert!(!DbError::Duplicate("key".into()).is_transient());
        assert!(!DbError::NotFound("session".into()).is_transient());
        assert!(!DbError::Query("syntax".into()).is_transient());
    }
}
