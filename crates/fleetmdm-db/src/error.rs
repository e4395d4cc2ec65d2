//! Error types for the fleetmdm-db crate.
//!
//! Wraps `SQLx` errors and classifies the ones a retrying transaction may
//! safely repeat.

use thiserror::Error;

/// SQLSTATE for a serialization failure under concurrent transactions.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for a detected deadlock.
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE for a unique constraint violation.
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// Database operation errors.
///
/// # Example
///
/// ```rust
/// use fleetmdm_db::DbError;
///
/// fn handle_error(err: DbError) {
///     match err {
///         DbError::ConnectionFailed(e) => eprintln!("Cannot connect: {}", e),
///         DbError::MigrationFailed(e) => eprintln!("Migration error: {}", e),
///         DbError::QueryFailed(e) => eprintln!("Query error: {}", e),
///         DbError::NotFound(msg) => eprintln!("Not found: {}", msg),
///         DbError::AlreadyExists(msg) => eprintln!("Conflict: {}", msg),
///         DbError::ValidationFailed(msg) => eprintln!("Validation: {}", msg),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to establish or acquire a database connection.
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A database migration failed to apply.
    #[error("Migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// A database query failed to execute.
    #[error("Query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A unique constraint rejected the write.
    ///
    /// The message names the violated constraint so callers can tell which
    /// key collided.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Validation failed.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl DbError {
    /// Check if this error indicates a connection problem.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DbError::ConnectionFailed(_))
    }

    /// Check if this error indicates a migration problem.
    #[must_use]
    pub fn is_migration_error(&self) -> bool {
        matches!(self, DbError::MigrationFailed(_))
    }

    /// Check if this error indicates a query problem.
    #[must_use]
    pub fn is_query_error(&self) -> bool {
        matches!(self, DbError::QueryFailed(_))
    }

    /// Check if this error indicates a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }

    /// Check if this error indicates a uniqueness conflict.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, DbError::AlreadyExists(_))
    }

    /// Check if this error indicates a validation error.
    #[must_use]
    pub fn is_validation_failed(&self) -> bool {
        matches!(self, DbError::ValidationFailed(_))
    }

    /// Whether the failed unit of work may succeed if run again.
    ///
    /// Serialization failures, deadlocks, pool timeouts and I/O errors are
    /// transient. Constraint violations and bad SQL are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::ConnectionFailed(e) | DbError::QueryFailed(e) => is_transient_sqlx(e),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(SQLSTATE_SERIALIZATION_FAILURE | SQLSTATE_DEADLOCK_DETECTED)
        ),
        _ => false,
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::RowNotFound) {
            return DbError::NotFound("row not found".to_string());
        }
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(SQLSTATE_UNIQUE_VIOLATION) {
                let constraint = db.constraint().unwrap_or("unique constraint").to_string();
                return DbError::AlreadyExists(constraint);
            }
        }
        if matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) {
            return DbError::ConnectionFailed(err);
        }
        DbError::QueryFailed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = DbError::NotFound("profile 7".to_string());
        assert_eq!(err.to_string(), "Not found: profile 7");
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_connection_error());
        assert!(err.is_transient());
    }

    #[test]
    fn test_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = DbError::from(sqlx::Error::Io(io));
        assert!(err.is_query_error());
        assert!(err.is_transient());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_protocol_error_is_not_transient() {
        let err = DbError::from(sqlx::Error::Protocol("bad frame".to_string()));
        assert!(!err.is_transient());
        assert!(!err.is_already_exists());
    }
}
