//! Transaction error types.

use thiserror::Error;

use crate::session::SessionError;
use crate::transaction::hooks::TransactionEvent;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Session layer error, passed through unchanged.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The context was entered while already active.
    #[error("transaction {tx_id} is already active")]
    AlreadyActive { tx_id: String },

    /// Transaction was already committed, rolled back or failed.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    NotActive { tx_id: String, state: String },

    /// Unknown propagation policy.
    #[error("invalid propagation: {0}")]
    InvalidPropagation(String),

    /// A mutation was attempted inside a read-only scope.
    #[error("transaction {tx_id} is read-only")]
    ReadOnly { tx_id: String },

    /// A `before_commit` hook vetoed the commit.
    #[error("{event} hook failed: {message}")]
    Hook {
        event: TransactionEvent,
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransactionError {
    /// Check if this error is a misuse of the scope lifecycle rather than a
    /// database failure.
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            TransactionError::AlreadyActive { .. }
                | TransactionError::NotActive { .. }
                | TransactionError::ReadOnly { .. }
        )
    }

    /// Check if this error came from the database.
    pub fn is_io(&self) -> bool {
        matches!(self, TransactionError::Session(e) if e.is_io())
    }

    /// Access the session error, if this is one.
    pub fn as_session(&self) -> Option<&SessionError> {
        match self {
            TransactionError::Session(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_active = TransactionError::NotActive {
            tx_id: "tx001".to_string(),
            state: "COMMITTED".to_string(),
        };
        assert!(not_active.is_state_violation());
        assert!(!not_active.is_io());

        let io: TransactionError = SessionError::database("commit", "disk full").into();
        assert!(io.is_io());
        assert!(!io.is_state_violation());
    }

    #[test]
    fn test_session_error_is_transparent() {
        let err: TransactionError = SessionError::SavepointNotFound("sp_1".into()).into();
        assert_eq!(err.to_string(), "savepoint not found: sp_1");
        assert!(matches!(
            err.as_session(),
            Some(SessionError::SavepointNotFound(name)) if name == "sp_1"
        ));
    }
}
