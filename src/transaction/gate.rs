//! Commit gate.
//!
//! Entity-layer code that wants to "commit" after a single statement calls
//! [`request_commit`] instead of committing the session directly. Inside a
//! suppressing scope the request turns into a flush, so the statement's
//! generated fields become visible while the real commit waits for the
//! scope to end. Outside any scope the request is an ordinary commit.

use std::fmt;

use crate::entity::Entity;
use crate::session::Session;
use crate::transaction::context::TransactionContext;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::slot::current_transaction;

/// What the gate does with a commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    /// Commit the session.
    Commit,
    /// Flush only; the enclosing scope commits later.
    Suppress,
}

impl fmt::Display for CommitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitDecision::Commit => write!(f, "commit"),
            CommitDecision::Suppress => write!(f, "suppress"),
        }
    }
}

/// Decide what a commit request does under `ctx`.
pub fn decide(ctx: Option<&TransactionContext>) -> CommitDecision {
    match ctx {
        Some(ctx) if ctx.should_suppress_commit() => CommitDecision::Suppress,
        _ => CommitDecision::Commit,
    }
}

/// Handle a statement-level commit request.
///
/// Runs on the current context's session when a context is installed for
/// the task, and on `session` otherwise. When `entity` is given it is
/// refreshed afterwards so database-generated values are loaded into it.
///
/// Returns [`TransactionError::ReadOnly`] without touching the session if
/// the current context is read-only. A commit allowed inside a nested scope
/// renews the savepoints of the scope chain, so the nested scopes can still
/// roll back what they write afterwards.
pub async fn request_commit(
    session: &dyn Session,
    entity: Option<&mut dyn Entity>,
) -> TransactionResult<CommitDecision> {
    let ctx = current_transaction();
    if let Some(ctx) = ctx.as_deref() {
        if ctx.is_read_only() && ctx.is_active() {
            return Err(TransactionError::ReadOnly {
                tx_id: ctx.id().to_string(),
            });
        }
    }

    if let Some(ctx) = ctx.as_deref() {
        ctx.settle().await?;
    }

    let decision = decide(ctx.as_deref());
    let session = match ctx.as_deref() {
        Some(ctx) => ctx.session().as_ref(),
        None => session,
    };

    match decision {
        CommitDecision::Commit => {
            session.commit().await?;
            // The commit released every savepoint on the session.
            if let Some(ctx) = ctx.as_deref() {
                ctx.reopen_savepoints().await?;
            }
        }
        CommitDecision::Suppress => {
            session.flush().await?;
            if let Some(ctx) = ctx.as_deref() {
                if ctx.log_suppressed_commit() {
                    tracing::debug!(
                        tx_id = %ctx.id(),
                        session = %session.id(),
                        "commit suppressed, session flushed"
                    );
                }
            }
        }
    }

    if let Some(entity) = entity {
        session.refresh(entity).await?;
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::entity::Record;
    use crate::session::{MemoryDatabase, SessionOperation};
    use crate::transaction::{slot, TransactionConfig, TransactionOptions, TransactionState};

    async fn active(
        db: &MemoryDatabase,
        options: TransactionOptions,
    ) -> Arc<TransactionContext> {
        let ctx = TransactionContext::new(
            Arc::new(db.open_session()),
            &options,
            &TransactionConfig::default(),
        );
        ctx.enter().await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_decide() {
        let db = MemoryDatabase::new();
        assert_eq!(decide(None), CommitDecision::Commit);

        let ctx = active(&db, TransactionOptions::default()).await;
        assert_eq!(decide(Some(&ctx)), CommitDecision::Suppress);
        {
            let _guard = ctx.allow_commit();
            assert_eq!(decide(Some(&ctx)), CommitDecision::Commit);
        }
        assert_eq!(decide(Some(&ctx)), CommitDecision::Suppress);

        let open = active(&db, TransactionOptions::default().suppress_commit(false)).await;
        assert_eq!(decide(Some(&open)), CommitDecision::Commit);
    }

    #[tokio::test]
    async fn test_commit_outside_scope() {
        let db = MemoryDatabase::new();
        let session = db.open_session();
        let mut user = Record::new("users").with("name", "Alice");

        session.add(&user).await.unwrap();
        let decision = request_commit(&session, Some(&mut user)).await.unwrap();

        assert_eq!(decision, CommitDecision::Commit);
        assert!(user.is_persisted());
        assert!(user.created_at().is_some());
        assert_eq!(db.count("users"), 1);
        assert_eq!(session.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_suppressed_inside_scope() {
        let db = MemoryDatabase::new();
        let ctx = active(&db, TransactionOptions::default()).await;
        let unused = db.open_session();

        let session = ctx.session().clone();
        let mut user = Record::new("users");
        slot::scope(ctx.clone(), async {
            session.add(&user).await.unwrap();
            let decision = request_commit(&unused, Some(&mut user)).await.unwrap();
            assert_eq!(decision, CommitDecision::Suppress);
        })
        .await;

        assert!(user.id().is_some(), "flush makes generated ids visible");
        assert_eq!(db.count("users"), 0);
        assert_eq!(db.stats().commits, 0);

        ctx.exit(None).await.unwrap();
        assert_eq!(db.count("users"), 1);
    }

    #[tokio::test]
    async fn test_allow_commit_goes_through() {
        let db = MemoryDatabase::new();
        let ctx = active(&db, TransactionOptions::default()).await;

        let session = ctx.session().clone();
        slot::scope(ctx.clone(), async {
            session.add(&Record::new("audit")).await.unwrap();
            let _guard = ctx.allow_commit();
            let decision = request_commit(session.as_ref(), None).await.unwrap();
            assert_eq!(decision, CommitDecision::Commit);
        })
        .await;

        assert_eq!(db.count("audit"), 1);
    }

    #[tokio::test]
    async fn test_read_only_rejects() {
        let db = MemoryDatabase::new();
        let ctx = active(&db, TransactionOptions::default().read_only(true)).await;

        let session = ctx.session().clone();
        let err = slot::scope(ctx.clone(), async {
            request_commit(session.as_ref(), None).await.unwrap_err()
        })
        .await;

        assert!(matches!(err, TransactionError::ReadOnly { .. }));
        assert_eq!(db.stats().flushes, 0);
    }

    #[tokio::test]
    async fn test_flush_failure_propagates() {
        let db = MemoryDatabase::new();
        let session = Arc::new(db.open_session());
        let ctx = TransactionContext::new(
            session.clone(),
            &TransactionOptions::default(),
            &TransactionConfig::default(),
        );
        ctx.enter().await.unwrap();
        session.fail_next(SessionOperation::Flush);

        let err = slot::scope(ctx.clone(), async {
            session.add(&Record::new("users")).await.unwrap();
            request_commit(session.as_ref(), None).await.unwrap_err()
        })
        .await;

        assert!(err.is_io());
        assert!(ctx.is_active(), "the gate never changes the scope state");
    }

    #[tokio::test]
    async fn test_allowed_commit_renews_savepoints() {
        let db = MemoryDatabase::new();
        let session = Arc::new(db.open_session());
        let outer = TransactionContext::new(
            session.clone(),
            &TransactionOptions::default(),
            &TransactionConfig::default(),
        );
        outer.enter().await.unwrap();
        let inner = TransactionContext::nested(
            &outer,
            &TransactionOptions::nested(),
            &TransactionConfig::default(),
        );
        inner.enter().await.unwrap();
        let before = inner.savepoints()[0].name.clone();

        let mut audit = Record::new("audit");
        let decision = slot::scope(inner.clone(), async {
            let _guard = inner.allow_commit();
            session.add(&audit).await.unwrap();
            request_commit(session.as_ref(), Some(&mut audit)).await.unwrap()
        })
        .await;

        assert_eq!(decision, CommitDecision::Commit);
        assert_eq!(db.count("audit"), 1);
        let renewed = inner.savepoints();
        assert_eq!(renewed.len(), 1);
        assert_ne!(renewed[0].name, before);
        assert_eq!(session.savepoint_names(), vec![renewed[0].name.clone()]);

        inner.exit(None).await.unwrap();
        assert_eq!(inner.state(), TransactionState::Committed);
        outer.exit(None).await.unwrap();
        assert_eq!(outer.state(), TransactionState::Committed);
    }
}
