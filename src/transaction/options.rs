//! Per-scope transaction options.

use crate::transaction::context::TransactionContext;
use crate::transaction::hooks::{HookRegistry, HookResult, TransactionEvent};
use crate::transaction::propagation::Propagation;

/// Options for one [`transaction`](crate::transaction::TransactionManager::transaction) scope.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// How the scope relates to a scope already running in the task.
    pub propagation: Propagation,
    /// Commit when the scope body succeeds.
    pub auto_commit: bool,
    /// Reject mutations and never commit.
    pub read_only: bool,
    /// Override the configured commit suppression; `None` inherits it.
    pub suppress_commit: Option<bool>,
    /// Hooks for this scope only, run after the global ones.
    pub hooks: HookRegistry,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            propagation: Propagation::Required,
            auto_commit: true,
            read_only: false,
            suppress_commit: None,
            hooks: HookRegistry::new(),
        }
    }
}

impl TransactionOptions {
    /// Create default options (`Required`, auto-commit, read-write).
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a `Required` scope.
    pub fn required() -> Self {
        Self::default()
    }

    /// Options for a `RequiresNew` scope.
    pub fn requires_new() -> Self {
        Self::default().propagation(Propagation::RequiresNew)
    }

    /// Options for a `Nested` scope.
    pub fn nested() -> Self {
        Self::default().propagation(Propagation::Nested)
    }

    /// Set the propagation policy.
    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set auto_commit flag.
    pub fn auto_commit(mut self, value: bool) -> Self {
        self.auto_commit = value;
        self
    }

    /// Set read_only flag.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Override commit suppression for this scope.
    pub fn suppress_commit(mut self, value: bool) -> Self {
        self.suppress_commit = Some(value);
        self
    }

    /// Add a hook for this scope.
    pub fn hook<F>(mut self, event: TransactionEvent, hook: F) -> Self
    where
        F: Fn(&TransactionContext) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register(event, hook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransactionOptions::default();
        assert_eq!(options.propagation, Propagation::Required);
        assert!(options.auto_commit);
        assert!(!options.read_only);
        assert_eq!(options.suppress_commit, None);
    }

    #[test]
    fn test_builders() {
        let options = TransactionOptions::nested()
            .read_only(true)
            .suppress_commit(false)
            .hook(TransactionEvent::AfterRollback, |_| Ok(()));
        assert_eq!(options.propagation, Propagation::Nested);
        assert!(options.read_only);
        assert_eq!(options.suppress_commit, Some(false));
        assert_eq!(options.hooks.len(), 1);

        let options = TransactionOptions::requires_new().auto_commit(false);
        assert_eq!(options.propagation, Propagation::RequiresNew);
        assert!(!options.auto_commit);
    }
}
