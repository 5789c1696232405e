//! Entity-layer mutations routed through the commit gate.

use std::sync::Arc;

use crate::entity::Entity;
use crate::session::Session;
use crate::transaction::gate::{request_commit, CommitDecision};
use crate::transaction::slot::current_transaction;
use crate::transaction::{TransactionError, TransactionResult};

/// Saves and deletes entities the way an ORM's per-statement helpers do:
/// stage the change, then optionally ask for a commit.
///
/// Inside a transaction scope the change goes to the scope's session and the
/// commit request is usually turned into a flush. Outside any scope the store
/// uses its own session and commits right away.
#[derive(Clone)]
pub struct EntityStore {
    session: Arc<dyn Session>,
}

impl EntityStore {
    /// Create a store that falls back to `session` outside any scope.
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }

    /// The session changes go to right now.
    pub fn session(&self) -> Arc<dyn Session> {
        match current_transaction() {
            Some(ctx) => ctx.session().clone(),
            None => self.session.clone(),
        }
    }

    /// Check the scope allows writes and return the session to write to,
    /// after any rollback owed by a cancelled child scope has run.
    async fn writable_session(&self) -> TransactionResult<Arc<dyn Session>> {
        let ctx = match current_transaction() {
            Some(ctx) => ctx,
            None => return Ok(self.session.clone()),
        };
        if ctx.is_read_only() && ctx.is_active() {
            return Err(TransactionError::ReadOnly {
                tx_id: ctx.id().to_string(),
            });
        }
        ctx.settle().await?;
        Ok(ctx.session().clone())
    }

    /// Insert or update `entity`.
    ///
    /// With `commit` set, the entity is refreshed afterwards so generated
    /// values (id, timestamps) are loaded into it. Returns the gate's decision,
    /// or `None` when no commit was requested.
    pub async fn save(
        &self,
        entity: &mut dyn Entity,
        commit: bool,
    ) -> TransactionResult<Option<CommitDecision>> {
        let session = self.writable_session().await?;
        session.add(&*entity).await?;
        if !commit {
            return Ok(None);
        }
        request_commit(session.as_ref(), Some(entity)).await.map(Some)
    }

    /// Delete `entity`.
    pub async fn delete(
        &self,
        entity: &dyn Entity,
        commit: bool,
    ) -> TransactionResult<Option<CommitDecision>> {
        let session = self.writable_session().await?;
        session.remove(entity).await?;
        if !commit {
            return Ok(None);
        }
        request_commit(session.as_ref(), None).await.map(Some)
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("session", &self.session.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Record;
    use crate::session::{MemoryDatabase, SessionError};
    use crate::transaction::{slot, TransactionConfig, TransactionContext, TransactionOptions};

    fn setup() -> (MemoryDatabase, EntityStore) {
        let db = MemoryDatabase::new();
        let store = EntityStore::new(Arc::new(db.open_session()));
        (db, store)
    }

    #[tokio::test]
    async fn test_save_without_commit_stages_only() {
        let (db, store) = setup();
        let mut user = Record::new("users");

        let decision = store.save(&mut user, false).await.unwrap();
        assert_eq!(decision, None);
        assert!(!user.is_persisted());
        assert_eq!(db.count("users"), 0);
    }

    #[tokio::test]
    async fn test_save_and_delete_outside_scope() {
        let (db, store) = setup();
        let mut user = Record::new("users").with("name", "Alice");

        let decision = store.save(&mut user, true).await.unwrap();
        assert_eq!(decision, Some(CommitDecision::Commit));
        let id = user.id().unwrap();

        user.set("name", "Alicia");
        store.save(&mut user, true).await.unwrap();
        assert_eq!(user.id(), Some(id), "updates keep the generated id");
        let row = db.get("users", user.identity()).unwrap();
        assert_eq!(row.get("name").and_then(|v| v.as_str()), Some("Alicia"));

        store.delete(&user, true).await.unwrap();
        assert_eq!(db.count("users"), 0);
        assert_eq!(db.stats().commits, 3);
    }

    #[tokio::test]
    async fn test_delete_unknown_entity() {
        let (_db, store) = setup();
        let err = store.delete(&Record::new("users"), true).await.unwrap_err();
        assert!(matches!(
            err.as_session(),
            Some(SessionError::EntityNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_scope_session_is_used() {
        let (db, store) = setup();
        let scope_session = Arc::new(db.open_session());
        let ctx = TransactionContext::new(
            scope_session.clone(),
            &TransactionOptions::default(),
            &TransactionConfig::default(),
        );
        ctx.enter().await.unwrap();

        let mut user = Record::new("users");
        let decision = slot::scope(ctx.clone(), async {
            assert_eq!(store.session().id(), scope_session.id());
            store.save(&mut user, true).await.unwrap()
        })
        .await;

        assert_eq!(decision, Some(CommitDecision::Suppress));
        assert!(user.is_persisted());
        assert_eq!(scope_session.flushed_len(), 1);
        assert_eq!(db.count("users"), 0);

        ctx.exit(None).await.unwrap();
        assert_eq!(db.count("users"), 1);
    }

    #[tokio::test]
    async fn test_read_only_scope_rejects_mutations() {
        let (db, store) = setup();
        let ctx = TransactionContext::new(
            Arc::new(db.open_session()),
            &TransactionOptions::default().read_only(true),
            &TransactionConfig::default(),
        );
        ctx.enter().await.unwrap();

        let user = Record::new("users");
        let err = slot::scope(ctx.clone(), async {
            store.delete(&user, false).await.unwrap_err()
        })
        .await;
        assert!(matches!(err, TransactionError::ReadOnly { .. }));
        assert!(err.is_state_violation());
    }
}
