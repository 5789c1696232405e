//! Propagation policies and context lifecycle states.
//!
//! txscope supports three propagation policies:
//! - Required: join the scope already running in this task, or start one
//! - RequiresNew: always start an independent scope on a fresh session
//! - Nested: open a savepoint inside the running scope

use std::fmt;

use crate::transaction::error::TransactionError;

/// How a new scope relates to the scope already running in the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Propagation {
    /// Join the active scope, or create a new one if there is none.
    ///
    /// A joining scope is a participant: it never commits or rolls back on
    /// its own, the outermost owner does.
    #[default]
    Required,

    /// Always create a new scope backed by a fresh session.
    ///
    /// The outer scope (if any) is suspended for the duration and resumes
    /// untouched afterwards. Commits here are independent of the outer scope.
    RequiresNew,

    /// Create a savepoint inside the active scope.
    ///
    /// Failure rolls back only to the savepoint; the outer scope can still
    /// commit. Without an active scope this behaves like `Required`.
    Nested,
}

impl Propagation {
    /// Check if this policy always starts its own database transaction.
    pub fn is_independent(&self) -> bool {
        matches!(self, Propagation::RequiresNew)
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Propagation::Required => write!(f, "REQUIRED"),
            Propagation::RequiresNew => write!(f, "REQUIRES_NEW"),
            Propagation::Nested => write!(f, "NESTED"),
        }
    }
}

/// Parse a propagation policy from configuration text.
impl std::str::FromStr for Propagation {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(['-', ' '], "_").as_str() {
            "REQUIRED" => Ok(Propagation::Required),
            "REQUIRES_NEW" | "REQUIRESNEW" => Ok(Propagation::RequiresNew),
            "NESTED" => Ok(Propagation::Nested),
            _ => Err(TransactionError::InvalidPropagation(s.to_string())),
        }
    }
}

/// Lifecycle state of a [`TransactionContext`](crate::transaction::TransactionContext).
///
/// `Inactive -> Active -> {Committed | RolledBack | Failed}`. The last three
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionState {
    #[default]
    Inactive,
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionState {
    /// Check if no further commit or rollback can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Inactive => write!(f, "INACTIVE"),
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
            TransactionState::Failed => write!(f, "FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_propagation() {
        assert_eq!(Propagation::default(), Propagation::Required);
        assert!(Propagation::RequiresNew.is_independent());
        assert!(!Propagation::Nested.is_independent());
    }

    #[test]
    fn test_parse_propagation() {
        assert_eq!(
            "required".parse::<Propagation>().unwrap(),
            Propagation::Required
        );
        assert_eq!(
            "requires-new".parse::<Propagation>().unwrap(),
            Propagation::RequiresNew
        );
        assert_eq!(
            "REQUIRES_NEW".parse::<Propagation>().unwrap(),
            Propagation::RequiresNew
        );
        assert_eq!(" Nested ".parse::<Propagation>().unwrap(), Propagation::Nested);
    }

    #[test]
    fn test_parse_unknown_propagation() {
        let err = "mandatory".parse::<Propagation>().unwrap_err();
        assert!(matches!(err, TransactionError::InvalidPropagation(ref s) if s == "mandatory"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TransactionState::Inactive.is_terminal());
        assert!(!TransactionState::Active.is_terminal());
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::RolledBack.is_terminal());
        assert!(TransactionState::Failed.is_terminal());
        assert_eq!(TransactionState::RolledBack.to_string(), "ROLLED_BACK");
    }
}
