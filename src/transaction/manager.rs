//! Transaction manager - opens, joins and finishes transaction scopes.
//!
//! The TransactionManager is the main entry point for transactions.
//! It handles:
//! - Resolving a scope's propagation against the task's current context
//! - Running the scope body with the context installed in the task slot
//! - Committing or rolling back when the body finishes, panics or is dropped
//! - Tracking open scopes for diagnostics

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::session::SessionProvider;
use crate::transaction::config::TransactionConfig;
use crate::transaction::context::{PendingRollback, TransactionContext, TransactionInfo};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::hooks::{HookResult, TransactionEvent};
use crate::transaction::options::TransactionOptions;
use crate::transaction::propagation::{Propagation, TransactionState};
use crate::transaction::slot;

/// Transaction manager - coordinates all transaction scopes.
///
/// Thread-safe: can be shared across tasks via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

struct TransactionManagerInner {
    /// Where sessions come from.
    provider: Arc<dyn SessionProvider>,
    /// Defaults copied into every new context.
    config: RwLock<TransactionConfig>,
    /// Contexts owned by an open scope, by ID.
    active: RwLock<HashMap<String, Arc<TransactionContext>>>,
    /// Rollbacks owed by dropped top-level scopes, by session ID.
    abandoned: Mutex<HashMap<String, PendingRollback>>,
}

impl TransactionManager {
    /// Create a manager that draws sessions from `provider`.
    pub fn new(provider: Arc<dyn SessionProvider>, config: TransactionConfig) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                provider,
                config: RwLock::new(config),
                active: RwLock::new(HashMap::new()),
                abandoned: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ==================== Configuration ====================

    /// Snapshot of the current configuration.
    pub fn config(&self) -> TransactionConfig {
        self.inner.config.read().clone()
    }

    /// Change the defaults for contexts created from now on.
    ///
    /// `None` leaves a setting unchanged. Scopes that are already open keep
    /// the values they were created with.
    pub fn configure(
        &self,
        default_suppress_commit: Option<bool>,
        log_suppressed_commit: Option<bool>,
    ) {
        let mut config = self.inner.config.write();
        if let Some(value) = default_suppress_commit {
            config.default_suppress_commit = value;
        }
        if let Some(value) = log_suppressed_commit {
            config.log_suppressed_commit = value;
        }
        tracing::debug!(
            default_suppress_commit = config.default_suppress_commit,
            log_suppressed_commit = config.log_suppressed_commit,
            "transaction defaults changed"
        );
    }

    /// Register a hook on every context created from now on.
    pub fn add_global_hook<F>(&self, event: TransactionEvent, hook: F)
    where
        F: Fn(&TransactionContext) -> HookResult + Send + Sync + 'static,
    {
        self.inner.config.write().global_hooks.register(event, hook);
    }

    // ==================== Diagnostics ====================

    /// The context installed for the running task, if any.
    pub fn current_transaction(&self) -> Option<Arc<TransactionContext>> {
        slot::current_transaction()
    }

    /// Get the number of open scopes that own a context.
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// List the IDs of contexts owned by open scopes.
    pub fn active_transactions(&self) -> Vec<String> {
        self.inner.active.read().keys().cloned().collect()
    }

    /// Get a snapshot of an open context.
    pub fn transaction_info(&self, tx_id: &str) -> Option<TransactionInfo> {
        self.inner.active.read().get(tx_id).map(|ctx| ctx.info())
    }

    fn mark_completed(&self, tx_id: &str) {
        self.inner.active.write().remove(tx_id);
    }

    // ==================== Abandoned scopes ====================

    /// Number of dropped top-level scopes whose rollback has not run yet.
    pub fn abandoned_count(&self) -> usize {
        self.inner.abandoned.lock().len()
    }

    /// Roll back the sessions of every dropped top-level scope on this task.
    ///
    /// A top-level scope on the request session that is dropped mid-flight
    /// leaves its rollback here, because the session may already be in use
    /// elsewhere on the task. It runs when the manager hands out the same
    /// session again, or when this is called, typically as the request ends.
    /// Returns how many rollbacks ran.
    pub async fn rollback_abandoned(&self) -> TransactionResult<usize> {
        let pending: Vec<PendingRollback> = self
            .inner
            .abandoned
            .lock()
            .drain()
            .map(|(_, rollback)| rollback)
            .collect();

        let count = pending.len();
        let mut first_error = None;
        for rollback in pending {
            if let Err(e) = rollback.run().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    fn defer_rollback(&self, rollback: PendingRollback) {
        let session_id = rollback.session_id().to_string();
        tracing::debug!(session = %session_id, "rollback deferred until the session is reused");
        // The newest scope's full rollback covers an older one.
        self.inner.abandoned.lock().insert(session_id, rollback);
    }

    async fn settle_session(&self, session_id: &str) -> TransactionResult<()> {
        let owed = self.inner.abandoned.lock().remove(session_id);
        match owed {
            Some(rollback) => rollback.run().await,
            None => Ok(()),
        }
    }

    // ==================== Scopes ====================

    /// Run `f` inside a transaction scope.
    ///
    /// The scope joins, nests in or replaces the task's current context
    /// according to `options.propagation`. A scope that owns its context
    /// commits when `f` returns `Ok` and rolls back when it returns `Err`,
    /// panics or is dropped. The body's error is returned as is; a failure
    /// to commit is returned through `E::from`.
    ///
    /// A `Required` scope that joins an outer context attaches its option
    /// hooks to that context, so they fire with the outer scope's events.
    /// Joining again with the same hooks (clones of one
    /// [`TransactionOptions`], as a [`Transactional`] uses) attaches them
    /// only once.
    ///
    /// A dropped scope that shares its session never touches it from
    /// another task. A nested scope leaves its savepoint rollback with its
    /// parent, which runs it before its next session operation. A
    /// top-level scope leaves it with the manager; see
    /// [`rollback_abandoned`](Self::rollback_abandoned).
    pub async fn transaction<F, Fut, T, E>(&self, options: TransactionOptions, f: F) -> Result<T, E>
    where
        F: FnOnce(Arc<TransactionContext>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        let config = self.config();
        match (options.propagation, slot::current_transaction()) {
            (Propagation::Required, Some(outer)) => {
                let state = outer.state();
                if state != TransactionState::Active {
                    return Err(outer.not_active(state).into());
                }
                outer.add_hooks(&options.hooks);
                outer.settle().await?;
                tracing::debug!(tx_id = %outer.id(), "joining transaction");
                f(outer).await
            }
            (Propagation::Nested, Some(outer)) => {
                let ctx = TransactionContext::nested(&outer, &options, &config);
                self.run_owned(ctx, false, f).await
            }
            (Propagation::RequiresNew, _) => {
                let session = self
                    .inner
                    .provider
                    .open()
                    .await
                    .map_err(TransactionError::from)?;
                let ctx = TransactionContext::new(session, &options, &config);
                self.run_owned(ctx, true, f).await
            }
            (_, None) => {
                let session = self
                    .inner
                    .provider
                    .session()
                    .await
                    .map_err(TransactionError::from)?;
                self.settle_session(session.id()).await?;
                let ctx = TransactionContext::new(session, &options, &config);
                self.run_owned(ctx, false, f).await
            }
        }
    }

    /// Wrap `f` so every call runs inside a transaction scope.
    pub fn transactional<F>(&self, options: TransactionOptions, f: F) -> Transactional<F> {
        Transactional {
            manager: self.clone(),
            options,
            f,
        }
    }

    async fn run_owned<F, Fut, T, E>(
        &self,
        ctx: Arc<TransactionContext>,
        close_session: bool,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Arc<TransactionContext>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        if let Err(e) = ctx.enter().await {
            if close_session {
                if let Err(close_err) = ctx.session().close().await {
                    tracing::warn!(tx_id = %ctx.id(), error = %close_err, "closing session failed");
                }
            }
            return Err(e.into());
        }

        self.inner
            .active
            .write()
            .insert(ctx.id().to_string(), ctx.clone());
        let mut guard = ScopeGuard {
            manager: self.clone(),
            ctx: ctx.clone(),
            close_session,
            armed: true,
        };

        let scoped = ctx.clone();
        let (outcome, exit) = slot::scope(ctx.clone(), async move {
            let outcome = f(scoped.clone()).await;
            let failure = outcome.as_ref().err().map(|e| e.to_string());
            let exit = scoped.exit(failure.as_deref()).await;
            (outcome, exit)
        })
        .await;

        guard.armed = false;
        drop(guard);

        if close_session {
            if let Err(e) = ctx.session().close().await {
                tracing::warn!(tx_id = %ctx.id(), error = %e, "closing session failed");
            }
        }

        match (outcome, exit) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(rollback_err)) => {
                tracing::error!(
                    tx_id = %ctx.id(),
                    error = %rollback_err,
                    "rollback failed after scope error"
                );
                Err(e)
            }
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .field("abandoned_count", &self.abandoned_count())
            .field("config", &*self.inner.config.read())
            .finish()
    }
}

/// Cleans up after an owning scope whose future never reached its exit.
struct ScopeGuard {
    manager: TransactionManager,
    ctx: Arc<TransactionContext>,
    close_session: bool,
    armed: bool,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.manager.mark_completed(self.ctx.id());
        if self.armed {
            if let Some(rollback) = self.ctx.abandon(self.close_session) {
                self.manager.defer_rollback(rollback);
            }
        }
    }
}

/// A function that runs inside a transaction scope on every call.
///
/// Built by [`TransactionManager::transactional`].
pub struct Transactional<F> {
    manager: TransactionManager,
    options: TransactionOptions,
    f: F,
}

impl<F> Transactional<F> {
    /// Run the wrapped function with `arg` inside a new scope.
    pub async fn call<A, Fut, T, E>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        let f = &self.f;
        self.manager
            .transaction(self.options.clone(), move |_| f(arg))
            .await
    }

    /// Options every call runs with.
    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }
}

impl<F> fmt::Debug for Transactional<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transactional")
            .field("options", &self.options)
            .finish()
    }
}
