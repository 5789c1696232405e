//! Unit-of-work transaction scopes.
//!
//! A transaction scope groups every write made while it runs into one
//! database transaction. Entity-layer code keeps its habit of committing
//! after each statement; inside a scope those commits go through the
//! [commit gate](gate) and become flushes, and the scope commits once when
//! its body succeeds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TransactionManager                       │
//! │   (resolves propagation, runs scope bodies, owns cleanup)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │◄──────│  Task-local │       │   Hooks     │
//!  │  Context    │       │    slot     │       │  Registry   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!        ▲                     ▲
//!        │                     │
//!  ┌─────────────┐       ┌─────────────┐
//!  │ Commit Gate │◄──────│ EntityStore │
//!  └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use txscope::entity::{EntityStore, Record};
//! use txscope::session::MemoryDatabase;
//! use txscope::transaction::{TransactionConfig, TransactionError, TransactionManager, TransactionOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), TransactionError> {
//! let db = MemoryDatabase::new();
//! let manager = TransactionManager::new(Arc::new(db.clone()), TransactionConfig::default());
//! let store = &EntityStore::new(Arc::new(db.open_session()));
//!
//! manager
//!     .transaction(TransactionOptions::default(), |_| async move {
//!         let mut user = Record::new("users").with("name", "Alice");
//!         store.save(&mut user, true).await?; // flushed, not committed
//!         assert!(user.id().is_some());
//!         Ok::<_, TransactionError>(())
//!     })
//!     .await?;
//!
//! assert_eq!(db.stats().commits, 1);
//! # Ok(())
//! # }
//! ```

mod config;
mod context;
mod error;
pub mod gate;
mod hooks;
mod manager;
mod options;
mod propagation;
pub(crate) mod slot;

pub use config::TransactionConfig;
pub use context::{AllowCommitGuard, Savepoint, TransactionContext, TransactionInfo};
pub use error::{TransactionError, TransactionResult};
pub use gate::{decide, request_commit, CommitDecision};
pub use hooks::{Hook, HookError, HookRegistry, HookResult, TransactionEvent};
pub use manager::{TransactionManager, Transactional};
pub use options::TransactionOptions;
pub use propagation::{Propagation, TransactionState};
pub use slot::{current_session, current_transaction};
