//! Lifecycle hooks.
//!
//! Hooks run synchronously at fixed points of a context's exit path:
//!
//! ```text
//! success:  before_commit ── commit / release savepoint ── after_commit
//! failure:  on_error ── before_rollback ── rollback / rollback to savepoint ── after_rollback
//! ```
//!
//! Only `before_commit` can change the outcome: an error from it turns the
//! commit into a rollback. Errors from every other hook are logged and ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::transaction::context::TransactionContext;

/// Points in a context's lifecycle where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionEvent {
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
    OnError,
}

impl TransactionEvent {
    /// All events, in firing order.
    pub const ALL: [TransactionEvent; 5] = [
        TransactionEvent::BeforeCommit,
        TransactionEvent::AfterCommit,
        TransactionEvent::OnError,
        TransactionEvent::BeforeRollback,
        TransactionEvent::AfterRollback,
    ];
}

impl fmt::Display for TransactionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionEvent::BeforeCommit => "before_commit",
            TransactionEvent::AfterCommit => "after_commit",
            TransactionEvent::BeforeRollback => "before_rollback",
            TransactionEvent::AfterRollback => "after_rollback",
            TransactionEvent::OnError => "on_error",
        };
        f.write_str(name)
    }
}

/// Error returned by a hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a hook.
pub type HookResult = Result<(), HookError>;

/// A lifecycle callback. It receives the context that is finishing.
pub type Hook = Arc<dyn Fn(&TransactionContext) -> HookResult + Send + Sync>;

/// Ordered hook lists per event.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<TransactionEvent, Vec<Hook>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook for `event`.
    pub fn register<F>(&mut self, event: TransactionEvent, hook: F)
    where
        F: Fn(&TransactionContext) -> HookResult + Send + Sync + 'static,
    {
        self.push(event, Arc::new(hook));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, event: TransactionEvent, hook: F) -> Self
    where
        F: Fn(&TransactionContext) -> HookResult + Send + Sync + 'static,
    {
        self.register(event, hook);
        self
    }

    pub(crate) fn push(&mut self, event: TransactionEvent, hook: Hook) {
        self.hooks.entry(event).or_default().push(hook);
    }

    /// Hooks for `event`, in registration order.
    pub fn get(&self, event: TransactionEvent) -> &[Hook] {
        self.hooks.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Append every hook of `other` after the hooks already registered.
    pub fn extend(&mut self, other: &HookRegistry) {
        for event in TransactionEvent::ALL {
            for hook in other.get(event) {
                self.push(event, hook.clone());
            }
        }
    }

    /// Like [`extend`](Self::extend), but skips hooks already registered for
    /// the same event. Hooks are the same when they share one allocation,
    /// as clones of one options value do.
    pub(crate) fn merge(&mut self, other: &HookRegistry) {
        for event in TransactionEvent::ALL {
            for hook in other.get(event) {
                let known = self.get(event).iter().any(|h| same_hook(h, hook));
                if !known {
                    self.push(event, hook.clone());
                }
            }
        }
    }

    /// Total number of hooks over all events.
    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    /// Check if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for event in TransactionEvent::ALL {
            let count = self.get(event).len();
            if count > 0 {
                map.entry(&event, &count);
            }
        }
        map.finish()
    }
}

fn same_hook(a: &Hook, b: &Hook) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
