//! Error types and result handling for storage and domain operations.
//!
//! Storage failures are translated into a small taxonomy so callers can tell
//! a missing row from a constraint violation without inspecting driver
//! errors.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input or an operation not allowed in the entity's current
    /// state.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stored JSON document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn json_errors_map_to_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = CoreError::from(json_err);
        assert!(matches!(err, CoreError::Serialization(_)));
        assert!(err.to_string().starts_with("Serialization error"));
    }
}
