//! Transaction context: the state machine behind one transaction scope.
//!
//! A context borrows a session for the lifetime of a scope and decides what
//! happens to it when the scope ends:
//! - `Inactive -> Active` on [`enter`](TransactionContext::enter)
//! - `Active -> Committed` when the scope succeeds
//! - `Active -> RolledBack | Failed` when it is abandoned or fails
//!
//! Contexts are shared (`Arc`) between the scope that owns them, the
//! task-local slot and any scope that joins them, so all mutable state sits
//! behind a lock that is never held across an `.await`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ulid::Ulid;

use crate::session::Session;
use crate::transaction::config::TransactionConfig;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::hooks::{Hook, HookRegistry, HookResult, TransactionEvent};
use crate::transaction::options::TransactionOptions;
use crate::transaction::propagation::{Propagation, TransactionState};

/// A savepoint opened by a nested scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    /// Savepoint name on the session.
    pub name: String,
    /// When the savepoint was opened.
    pub created_at: DateTime<Utc>,
}

impl Savepoint {
    fn generate() -> Self {
        Self {
            name: format!("sp_{}", Ulid::new().to_string().to_lowercase()),
            created_at: Utc::now(),
        }
    }
}

/// Point-in-time description of a context, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Unique context ID.
    pub tx_id: String,
    /// Session the context runs on.
    pub session_id: String,
    /// Propagation the context was created with.
    pub propagation: Propagation,
    /// Lifecycle state.
    pub state: TransactionState,
    /// Whether the context rejects mutations.
    pub read_only: bool,
    /// Number of enclosing savepoint scopes.
    pub depth: usize,
    /// When the context was created.
    pub started_at: DateTime<Utc>,
}

struct ContextInner {
    state: TransactionState,
    /// Set while a commit or rollback is in flight.
    finishing: bool,
    allow_commit_depth: usize,
    savepoints: Vec<Savepoint>,
    hooks: HookRegistry,
    failure: Option<String>,
    /// Rollbacks owed by child scopes that were dropped mid-flight.
    pending: Vec<PendingRollback>,
}

/// One logical transaction scope.
pub struct TransactionContext {
    id: String,
    session: Arc<dyn Session>,
    propagation: Propagation,
    auto_commit: bool,
    read_only: bool,
    suppress_commit: bool,
    log_suppressed_commit: bool,
    parent: Option<Arc<TransactionContext>>,
    started_at: DateTime<Utc>,
    inner: Mutex<ContextInner>,
}

impl TransactionContext {
    /// Create a top-level context on `session`.
    ///
    /// Unset options are taken from `config`. A `Nested` propagation has no
    /// savepoint to open without a parent, so it is recorded as `Required`.
    pub fn new(
        session: Arc<dyn Session>,
        options: &TransactionOptions,
        config: &TransactionConfig,
    ) -> Arc<Self> {
        let propagation = match options.propagation {
            Propagation::Nested => Propagation::Required,
            other => other,
        };
        Arc::new(Self::build(session, propagation, options, config, None))
    }

    /// Create a savepoint-backed context inside `parent`, sharing its session.
    ///
    /// A child of a read-only context is read-only too.
    pub fn nested(
        parent: &Arc<TransactionContext>,
        options: &TransactionOptions,
        config: &TransactionConfig,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            parent.session.clone(),
            Propagation::Nested,
            options,
            config,
            Some(parent.clone()),
        ))
    }

    fn build(
        session: Arc<dyn Session>,
        propagation: Propagation,
        options: &TransactionOptions,
        config: &TransactionConfig,
        parent: Option<Arc<TransactionContext>>,
    ) -> Self {
        let mut hooks = config.global_hooks.clone();
        hooks.extend(&options.hooks);
        let read_only = options.read_only || parent.as_ref().is_some_and(|p| p.read_only);

        Self {
            id: Ulid::new().to_string().to_lowercase(),
            session,
            propagation,
            auto_commit: options.auto_commit,
            read_only,
            suppress_commit: options
                .suppress_commit
                .unwrap_or(config.default_suppress_commit),
            log_suppressed_commit: config.log_suppressed_commit,
            parent,
            started_at: Utc::now(),
            inner: Mutex::new(ContextInner {
                state: TransactionState::Inactive,
                finishing: false,
                allow_commit_depth: 0,
                savepoints: Vec::new(),
                hooks,
                failure: None,
                pending: Vec::new(),
            }),
        }
    }

    // ==================== Accessors ====================

    /// Get the context ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the session this context runs on.
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Get the propagation policy.
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// Get the lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Check if the context is active.
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Check if the context rejects mutations.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Check if a successful exit commits.
    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// The static suppression policy of this scope.
    pub fn suppress_commit_flag(&self) -> bool {
        self.suppress_commit
    }

    /// Check if suppressed commits should be logged.
    pub fn log_suppressed_commit(&self) -> bool {
        self.log_suppressed_commit
    }

    /// Number of open [`allow_commit`](Self::allow_commit) guards.
    pub fn allow_commit_depth(&self) -> usize {
        self.inner.lock().allow_commit_depth
    }

    /// Savepoints opened by this context, oldest first.
    pub fn savepoints(&self) -> Vec<Savepoint> {
        self.inner.lock().savepoints.clone()
    }

    /// The outer context of a nested scope.
    pub fn parent(&self) -> Option<&Arc<TransactionContext>> {
        self.parent.as_ref()
    }

    /// Number of enclosing contexts; 0 for a top-level context.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_ref();
        while let Some(parent) = current {
            depth += 1;
            current = parent.parent.as_ref();
        }
        depth
    }

    /// When the context was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Message of the error that ended the context, if it failed.
    pub fn failure(&self) -> Option<String> {
        self.inner.lock().failure.clone()
    }

    /// Snapshot for diagnostics.
    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            tx_id: self.id.clone(),
            session_id: self.session.id().to_string(),
            propagation: self.propagation,
            state: self.state(),
            read_only: self.read_only,
            depth: self.depth(),
            started_at: self.started_at,
        }
    }

    // ==================== Commit suppression ====================

    /// Check if a statement-level commit request must be turned into a flush.
    ///
    /// Computed on every call: the scope is active and either read-only, or
    /// suppressing with no [`allow_commit`](Self::allow_commit) guard open.
    pub fn should_suppress_commit(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == TransactionState::Active
            && (self.read_only || (self.suppress_commit && inner.allow_commit_depth == 0))
    }

    /// Let commit requests through while the returned guard is alive.
    ///
    /// Guards nest; suppression resumes when the last one is dropped. A
    /// commit issued under a guard is durable even if this scope later
    /// rolls back.
    pub fn allow_commit(self: &Arc<Self>) -> AllowCommitGuard {
        self.inner.lock().allow_commit_depth += 1;
        AllowCommitGuard { ctx: self.clone() }
    }

    // ==================== Hooks ====================

    /// Register a hook on this context.
    pub fn on<F>(&self, event: TransactionEvent, hook: F)
    where
        F: Fn(&TransactionContext) -> HookResult + Send + Sync + 'static,
    {
        self.inner.lock().hooks.register(event, hook);
    }

    /// Attach the hooks of a joining scope, skipping any already attached.
    pub(crate) fn add_hooks(&self, hooks: &HookRegistry) {
        if !hooks.is_empty() {
            self.inner.lock().hooks.merge(hooks);
        }
    }

    fn hooks_for(&self, event: TransactionEvent) -> Vec<Hook> {
        self.inner.lock().hooks.get(event).to_vec()
    }

    /// Run hooks for `event`, stopping at the first error.
    fn run_hooks(&self, event: TransactionEvent) -> HookResult {
        for hook in self.hooks_for(event) {
            hook(self)?;
        }
        Ok(())
    }

    /// Run every hook for `event`, logging errors.
    fn fire(&self, event: TransactionEvent) {
        for hook in self.hooks_for(event) {
            if let Err(e) = hook(self) {
                tracing::warn!(tx_id = %self.id, %event, error = %e, "transaction hook failed");
            }
        }
    }

    // ==================== Lifecycle ====================

    pub(crate) fn not_active(&self, state: TransactionState) -> TransactionError {
        TransactionError::NotActive {
            tx_id: self.id.clone(),
            state: state.to_string(),
        }
    }

    fn set_state(&self, state: TransactionState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.finishing = false;
    }

    fn record_failure(&self, message: &str) {
        let mut inner = self.inner.lock();
        if inner.failure.is_none() {
            inner.failure = Some(message.to_string());
        }
    }

    /// Claim the right to finish an active context. Returns false if it is
    /// not active or another commit/rollback is already in flight.
    fn begin_finish(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Active || inner.finishing {
            return false;
        }
        inner.finishing = true;
        true
    }

    /// Activate the context.
    ///
    /// A nested context opens its savepoint here, on the parent's session.
    /// Entering a context twice is a programming error.
    pub async fn enter(&self) -> TransactionResult<()> {
        let state = self.state();
        match state {
            TransactionState::Inactive => {}
            TransactionState::Active => {
                return Err(TransactionError::AlreadyActive {
                    tx_id: self.id.clone(),
                })
            }
            terminal => return Err(self.not_active(terminal)),
        }

        if let Some(parent) = &self.parent {
            let parent_state = parent.state();
            if parent_state != TransactionState::Active {
                return Err(parent.not_active(parent_state));
            }

            if let Err(e) = parent.settle().await {
                self.record_failure(&e.to_string());
                self.set_state(TransactionState::Failed);
                return Err(e);
            }

            let savepoint = Savepoint::generate();
            if let Err(e) = self.session.begin_savepoint(&savepoint.name).await {
                self.record_failure(&e.to_string());
                self.set_state(TransactionState::Failed);
                return Err(e.into());
            }
            tracing::debug!(tx_id = %self.id, savepoint = %savepoint.name, "savepoint created");
            self.inner.lock().savepoints.push(savepoint);
        }

        self.set_state(TransactionState::Active);
        tracing::debug!(
            tx_id = %self.id,
            propagation = %self.propagation,
            session = %self.session.id(),
            "transaction started"
        );
        Ok(())
    }

    /// Finish the scope.
    ///
    /// `error` is the message of the error that ended the scope body, if
    /// any. On success the context commits (when auto-commit is on and it is
    /// not read-only) or rolls back. On error it rolls back and ends
    /// `Failed`; the caller re-raises its own error.
    ///
    /// Exiting a context that is not active does nothing.
    pub async fn exit(&self, error: Option<&str>) -> TransactionResult<()> {
        let state = self.state();
        if state != TransactionState::Active {
            tracing::debug!(tx_id = %self.id, %state, "exit on inactive transaction ignored");
            return Ok(());
        }

        match error {
            None if self.auto_commit && !self.read_only => self.commit().await,
            None => self.rollback().await,
            Some(message) => {
                if !self.begin_finish() {
                    return Ok(());
                }
                self.record_failure(message);
                self.fire(TransactionEvent::OnError);
                self.finish_rollback(TransactionState::Failed).await
            }
        }
    }

    /// Commit the context now.
    ///
    /// Releases the savepoint of a nested context, commits the session
    /// otherwise. Does nothing unless the context is active.
    pub async fn commit(&self) -> TransactionResult<()> {
        if !self.begin_finish() {
            tracing::debug!(tx_id = %self.id, state = %self.state(), "commit ignored");
            return Ok(());
        }

        if let Err(e) = self.settle().await {
            self.record_failure(&e.to_string());
            if let Err(rollback_err) = self.finish_rollback(TransactionState::Failed).await {
                tracing::error!(
                    tx_id = %self.id,
                    error = %rollback_err,
                    "rollback after failed cleanup failed"
                );
            }
            return Err(e);
        }

        if let Err(e) = self.run_hooks(TransactionEvent::BeforeCommit) {
            let message = e.to_string();
            tracing::warn!(tx_id = %self.id, error = %message, "before_commit hook vetoed commit");
            self.record_failure(&message);
            if let Err(rollback_err) = self.finish_rollback(TransactionState::Failed).await {
                tracing::error!(
                    tx_id = %self.id,
                    error = %rollback_err,
                    "rollback after vetoed commit failed"
                );
            }
            return Err(TransactionError::Hook {
                event: TransactionEvent::BeforeCommit,
                message,
            });
        }

        let savepoint = self.inner.lock().savepoints.pop();
        let result = match (&savepoint, &self.parent) {
            (Some(sp), _) => self.session.release_savepoint(&sp.name).await,
            (None, None) => self.session.commit().await,
            (None, Some(_)) => Ok(()),
        };

        if let Err(e) = result {
            self.record_failure(&e.to_string());
            self.set_state(TransactionState::Failed);
            let cleanup = match (&savepoint, &self.parent) {
                (Some(sp), _) => self.session.rollback_to_savepoint(&sp.name).await,
                (None, None) => self.session.rollback().await,
                (None, Some(_)) => Ok(()),
            };
            if let Err(cleanup_err) = cleanup {
                tracing::error!(
                    tx_id = %self.id,
                    error = %cleanup_err,
                    "rollback after failed commit failed"
                );
            }
            return Err(e.into());
        }

        self.set_state(TransactionState::Committed);
        match &savepoint {
            Some(sp) => tracing::debug!(tx_id = %self.id, savepoint = %sp.name, "savepoint released"),
            None => tracing::debug!(tx_id = %self.id, "transaction committed"),
        }
        self.fire(TransactionEvent::AfterCommit);
        Ok(())
    }

    /// Roll the context back now. Does nothing unless the context is active.
    pub async fn rollback(&self) -> TransactionResult<()> {
        if !self.begin_finish() {
            tracing::debug!(tx_id = %self.id, state = %self.state(), "rollback ignored");
            return Ok(());
        }
        self.finish_rollback(TransactionState::RolledBack).await
    }

    async fn finish_rollback(&self, terminal: TransactionState) -> TransactionResult<()> {
        if let Err(e) = self.settle().await {
            tracing::warn!(tx_id = %self.id, error = %e, "cleanup of abandoned child scope failed");
        }
        self.fire(TransactionEvent::BeforeRollback);

        let savepoint = self.inner.lock().savepoints.pop();
        let result = match (&savepoint, &self.parent) {
            (Some(sp), _) => self.session.rollback_to_savepoint(&sp.name).await,
            (None, None) => self.session.rollback().await,
            (None, Some(_)) => {
                tracing::warn!(tx_id = %self.id, "savepoint already gone, nothing to roll back");
                Ok(())
            }
        };

        if let Err(e) = result {
            self.record_failure(&e.to_string());
            self.set_state(TransactionState::Failed);
            return Err(e.into());
        }

        self.set_state(terminal);
        tracing::debug!(tx_id = %self.id, state = %terminal, "transaction rolled back");
        self.fire(TransactionEvent::AfterRollback);
        Ok(())
    }

    /// Run the rollbacks owed by child scopes that were dropped mid-flight,
    /// innermost first, on this task.
    ///
    /// Transaction operations, the commit gate and
    /// [`EntityStore`](crate::entity::EntityStore) call this before touching
    /// the session. Call it before using [`session`](Self::session) directly
    /// after a child scope may have been cancelled.
    pub async fn settle(&self) -> TransactionResult<()> {
        let mut first_error = None;
        let mut current = Some(self);
        while let Some(ctx) = current {
            let pending = std::mem::take(&mut ctx.inner.lock().pending);
            for rollback in pending {
                if let Err(e) = rollback.run().await {
                    first_error.get_or_insert(e);
                }
            }
            current = ctx.parent.as_deref();
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Replace the savepoints of this context and its ancestors after the
    /// shared session was committed, which released all of them.
    pub(crate) async fn reopen_savepoints(&self) -> TransactionResult<()> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(ctx) = current {
            chain.push(ctx);
            current = ctx.parent.as_deref();
        }

        for ctx in chain.into_iter().rev() {
            let released = std::mem::take(&mut ctx.inner.lock().savepoints);
            for old in released {
                let savepoint = Savepoint::generate();
                ctx.session.begin_savepoint(&savepoint.name).await?;
                tracing::debug!(
                    tx_id = %ctx.id,
                    released = %old.name,
                    savepoint = %savepoint.name,
                    "savepoint reopened after commit"
                );
                ctx.inner.lock().savepoints.push(savepoint);
            }
        }
        Ok(())
    }

    /// Mark a context whose scope was dropped mid-flight (panic or
    /// cancellation) as failed and arrange its rollback.
    ///
    /// With `owns_session` the session belongs to this scope alone, so the
    /// rollback and the close run in a spawned task. Otherwise the session is
    /// still in use by this task and only this task may roll it back: a
    /// nested context hands its savepoint rollback to its parent, which runs
    /// it before its next session operation, and a top-level context returns
    /// the rollback to the caller.
    ///
    /// Must be callable from `Drop`, so nothing here awaits.
    pub(crate) fn abandon(self: &Arc<Self>, owns_session: bool) -> Option<PendingRollback> {
        let abandoned = {
            let mut inner = self.inner.lock();
            if inner.state == TransactionState::Active {
                inner.state = TransactionState::Failed;
                inner.finishing = false;
                if inner.failure.is_none() {
                    inner.failure = Some("transaction scope abandoned".to_string());
                }
                Some((inner.savepoints.pop(), std::mem::take(&mut inner.pending)))
            } else {
                None
            }
        };

        let (savepoint, owed) = match abandoned {
            Some(abandoned) => abandoned,
            None => {
                if owns_session {
                    self.spawn_cleanup(None);
                }
                return None;
            }
        };

        tracing::warn!(tx_id = %self.id, "transaction scope abandoned, rolling back");
        self.fire(TransactionEvent::OnError);
        self.fire(TransactionEvent::BeforeRollback);
        let rollback = PendingRollback {
            ctx: self.clone(),
            savepoint,
        };

        // A full session rollback covers whatever the children still owed.
        if owns_session {
            self.spawn_cleanup(Some(rollback));
            return None;
        }
        match &self.parent {
            Some(parent) => {
                let mut parent_inner = parent.inner.lock();
                parent_inner.pending.extend(owed);
                parent_inner.pending.push(rollback);
                None
            }
            None => Some(rollback),
        }
    }

    fn spawn_cleanup(&self, rollback: Option<PendingRollback>) {
        let session = self.session.clone();
        let tx_id = self.id.clone();
        let cleanup = async move {
            if let Some(rollback) = rollback {
                // Failures are logged by `run`.
                rollback.run().await.ok();
            }
            if let Err(e) = session.close().await {
                tracing::warn!(%tx_id, error = %e, "closing session failed");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => {
                tracing::error!(tx_id = %self.id, "no runtime to roll back abandoned transaction");
            }
        }
    }
}

/// Rollback owed by a context whose scope was dropped before it could exit.
pub(crate) struct PendingRollback {
    ctx: Arc<TransactionContext>,
    savepoint: Option<Savepoint>,
}

impl PendingRollback {
    /// Session the rollback has to run on.
    pub(crate) fn session_id(&self) -> &str {
        self.ctx.session.id()
    }

    pub(crate) async fn run(self) -> TransactionResult<()> {
        let ctx = &self.ctx;
        let result = match (&self.savepoint, &ctx.parent) {
            (Some(sp), _) => ctx.session.rollback_to_savepoint(&sp.name).await,
            (None, None) => ctx.session.rollback().await,
            (None, Some(_)) => Ok(()),
        };
        match result {
            Ok(()) => {
                tracing::debug!(tx_id = %ctx.id, "abandoned transaction rolled back");
                ctx.fire(TransactionEvent::AfterRollback);
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    tx_id = %ctx.id,
                    error = %e,
                    "rollback of abandoned transaction failed"
                );
                Err(e.into())
            }
        }
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("propagation", &self.propagation)
            .field("state", &inner.state)
            .field("read_only", &self.read_only)
            .field("suppress_commit", &self.suppress_commit)
            .field("allow_commit_depth", &inner.allow_commit_depth)
            .field("savepoints", &inner.savepoints.len())
            .finish()
    }
}

/// Keeps commit suppression lifted; see [`TransactionContext::allow_commit`].
#[must_use = "suppression resumes as soon as the guard is dropped"]
pub struct AllowCommitGuard {
    ctx: Arc<TransactionContext>,
}

impl AllowCommitGuard {
    /// The context whose suppression is lifted.
    pub fn context(&self) -> &Arc<TransactionContext> {
        &self.ctx
    }
}

impl Drop for AllowCommitGuard {
    fn drop(&mut self) {
        let mut inner = self.ctx.inner.lock();
        inner.allow_commit_depth = inner.allow_commit_depth.saturating_sub(1);
    }
}

impl fmt::Debug for AllowCommitGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllowCommitGuard")
            .field("tx_id", &self.ctx.id)
            .finish()
    }
}
