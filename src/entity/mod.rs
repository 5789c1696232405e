//! Entities as the transaction layer sees them.
//!
//! The ORM's data modelling is an external concern. All the transaction
//! layer needs from an entity is the table it lives in, a client-side
//! identity the session can track it by, its column values, and a way to
//! load the server's view of it back after a flush or refresh.

mod record;
mod store;

use std::collections::BTreeMap;

use serde_json::Value;
use ulid::Ulid;

pub use record::Record;
pub use store::EntityStore;

/// Column values keyed by column name.
///
/// BTreeMap keeps column order stable in logs and test output.
pub type Row = BTreeMap<String, Value>;

/// Generated primary key column.
pub const ID_COLUMN: &str = "id";
/// Server-side creation timestamp column (RFC 3339).
pub const CREATED_AT_COLUMN: &str = "created_at";
/// Server-side modification timestamp column (RFC 3339).
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Something a [`Session`](crate::session::Session) can persist.
pub trait Entity: Send + Sync {
    /// Table the entity is stored in.
    fn table(&self) -> &str;

    /// Client-side identity, stable across flushes and commits.
    fn identity(&self) -> Ulid;

    /// Column values to write. Generated columns may be omitted.
    fn values(&self) -> Row;

    /// Replace the entity's state with the row the database holds for it.
    fn load(&mut self, row: &Row);
}
