//! txscope - Unit-of-Work transaction scopes for ORM sessions
//!
//! This crate groups the writes of a business operation into a single
//! database transaction, even when the code underneath commits after every
//! statement. A scope installs a transaction context for the running tokio
//! task; statement-level commits made while it is installed become flushes,
//! and the scope commits once at the end (or rolls back on error, panic or
//! cancellation).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use txscope::entity::{EntityStore, Record};
//! use txscope::session::MemoryDatabase;
//! use txscope::transaction::{TransactionConfig, TransactionError, TransactionManager, TransactionOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let db = MemoryDatabase::new();
//! let manager = TransactionManager::new(Arc::new(db.clone()), TransactionConfig::default());
//! let store = &EntityStore::new(Arc::new(db.open_session()));
//!
//! let result: Result<(), TransactionError> = manager
//!     .transaction(TransactionOptions::default(), |ctx| async move {
//!         store.save(&mut Record::new("orders"), true).await?;
//!         ctx.rollback().await
//!     })
//!     .await;
//!
//! assert!(result.is_ok());
//! assert_eq!(db.count("orders"), 0);
//! # }
//! ```

pub mod entity;
pub mod session;
pub mod transaction;

pub use entity::{Entity, EntityStore, Record};
pub use session::{Session, SessionError, SessionProvider};
pub use transaction::{
    current_session, current_transaction, Propagation, TransactionConfig, TransactionContext,
    TransactionError, TransactionManager, TransactionOptions,
};
