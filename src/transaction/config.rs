//! Process-wide transaction configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::transaction::context::TransactionContext;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::hooks::{HookRegistry, HookResult, TransactionEvent};

/// Transaction defaults, built once at startup and handed to the
/// [`TransactionManager`](crate::transaction::TransactionManager).
///
/// Every new context copies these values when it is created, so later
/// changes never reach a scope that is already running.
///
/// ```
/// use txscope::transaction::TransactionConfig;
///
/// let config = TransactionConfig::from_json(r#"{ "log_suppressed_commit": true }"#).unwrap();
/// assert!(config.default_suppress_commit);
/// assert!(config.log_suppressed_commit);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Suppress statement-level commits inside a scope unless the scope says
    /// otherwise.
    pub default_suppress_commit: bool,
    /// Log every suppressed commit at debug level.
    pub log_suppressed_commit: bool,
    /// Hooks installed on every new context, ahead of scope-specific ones.
    #[serde(skip)]
    pub global_hooks: HookRegistry,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_suppress_commit: true,
            log_suppressed_commit: false,
            global_hooks: HookRegistry::new(),
        }
    }
}

impl TransactionConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default_suppress_commit flag.
    pub fn default_suppress_commit(mut self, value: bool) -> Self {
        self.default_suppress_commit = value;
        self
    }

    /// Set log_suppressed_commit flag.
    pub fn log_suppressed_commit(mut self, value: bool) -> Self {
        self.log_suppressed_commit = value;
        self
    }

    /// Add a global hook.
    pub fn hook<F>(mut self, event: TransactionEvent, hook: F) -> Self
    where
        F: Fn(&TransactionContext) -> HookResult + Send + Sync + 'static,
    {
        self.global_hooks.register(event, hook);
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> TransactionResult<Self> {
        serde_json::from_str(json).map_err(|e| TransactionError::Config(e.to_string()))
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> TransactionResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransactionError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TransactionConfig::default();
        assert!(config.default_suppress_commit);
        assert!(!config.log_suppressed_commit);
        assert!(config.global_hooks.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = TransactionConfig::new()
            .default_suppress_commit(false)
            .log_suppressed_commit(true)
            .hook(TransactionEvent::AfterCommit, |_| Ok(()));
        assert!(!config.default_suppress_commit);
        assert!(config.log_suppressed_commit);
        assert_eq!(config.global_hooks.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "default_suppress_commit": false }}"#).unwrap();

        let config = TransactionConfig::load(file.path()).unwrap();
        assert!(!config.default_suppress_commit);
        assert!(!config.log_suppressed_commit);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = TransactionConfig::load(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(TransactionError::Config(_))));

        let bad = TransactionConfig::from_json(r#"{ "default_suppress_commit": "yes" }"#);
        assert!(matches!(bad, Err(TransactionError::Config(_))));
    }
}
