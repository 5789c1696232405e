//! Session layer for txscope
//!
//! The transaction engine never talks to a database directly. It drives a
//! [`Session`], the narrow contract an ORM session has to honor, and obtains
//! sessions from a [`SessionProvider`] owned by the surrounding request or task
//! scoping mechanism.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SessionProvider                          │
//! │     (request-scoped session, independent sessions)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Session                              │
//! │  add / remove ── flush ── refresh ── commit / rollback      │
//! │            savepoint begin / release / rollback             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`memory`] ships an in-process implementation with the same visibility
//! rules as a real database session: flushed writes are visible to the
//! session that made them, committed writes to everybody.

mod error;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::Entity;

pub use error::{SessionError, SessionResult};
pub use memory::{MemoryDatabase, MemorySession, MemoryStats, SessionOperation};

/// A unit-of-work database session.
///
/// Sessions buffer pending changes in memory. `flush` pushes them to the
/// database inside the open database transaction, `commit` makes them
/// durable, `rollback` discards everything since the last commit.
///
/// A session is used by one concurrency unit at a time. Implementations use
/// interior mutability because the transaction layer shares a session between
/// an outer scope and its nested scopes.
#[async_trait]
pub trait Session: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Stage an insert or update of `entity`.
    async fn add(&self, entity: &dyn Entity) -> SessionResult<()>;

    /// Stage a delete of `entity`.
    async fn remove(&self, entity: &dyn Entity) -> SessionResult<()>;

    /// Push pending changes to the database without ending the transaction.
    async fn flush(&self) -> SessionResult<()>;

    /// Reload `entity` from the state visible to this session, including
    /// generated keys and server-side defaults.
    async fn refresh(&self, entity: &mut dyn Entity) -> SessionResult<()>;

    /// Flush and commit the database transaction.
    async fn commit(&self) -> SessionResult<()>;

    /// Discard everything since the last commit.
    async fn rollback(&self) -> SessionResult<()>;

    /// Open a savepoint named `name`.
    async fn begin_savepoint(&self, name: &str) -> SessionResult<()>;

    /// Release the savepoint, keeping its changes in the enclosing transaction.
    async fn release_savepoint(&self, name: &str) -> SessionResult<()>;

    /// Discard changes made since the savepoint and drop the savepoint.
    async fn rollback_to_savepoint(&self, name: &str) -> SessionResult<()>;

    /// Return the session's resources. Further use is an error.
    async fn close(&self) -> SessionResult<()> {
        Ok(())
    }
}

/// Hands out sessions to the transaction manager.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The session bound to the current request or task.
    async fn session(&self) -> SessionResult<Arc<dyn Session>>;

    /// A new session on its own connection, isolated from every other session.
    async fn open(&self) -> SessionResult<Arc<dyn Session>>;
}
