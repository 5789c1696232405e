//! Session layer error types
//!
//! Every error a database session can surface to the transaction layer is
//! defined here. The transaction layer never translates these; it hands them
//! back to the caller unchanged.

use thiserror::Error;
use ulid::Ulid;

/// the main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// the database rejected or failed an operation
    #[error("database error during {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    /// the entity has no row visible to this session
    #[error("entity not found: table={table}, identity={identity}")]
    EntityNotFound { table: String, identity: Ulid },

    /// no savepoint with this name is open on the session
    #[error("savepoint not found: {0}")]
    SavepointNotFound(String),

    /// a savepoint with this name is already open on the session
    #[error("savepoint already exists: {0}")]
    SavepointExists(String),

    /// the session was closed and can no longer be used
    #[error("session {0} is closed")]
    Closed(String),

    /// the provider could not hand out a session
    #[error("session unavailable: {0}")]
    Unavailable(String),

    /// I/O error talking to the database
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// create a database error for the given operation
    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SessionError::EntityNotFound { .. } | SessionError::SavepointNotFound(_)
        )
    }

    /// check if this error came from the database round trip itself
    pub fn is_io(&self) -> bool {
        matches!(self, SessionError::Database { .. } | SessionError::Io(_))
    }
}

/// result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
