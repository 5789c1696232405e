//! In-memory database and session.
//!
//! [`MemoryDatabase`] holds committed rows. Each [`MemorySession`] keeps two
//! buffers on top of it:
//! - pending: staged by `add`/`remove`, invisible to the database
//! - flushed: sent to the database inside the open transaction, visible to
//!   this session only until commit
//!
//! Savepoints are indexes into the flushed buffer. Rolling back to one
//! truncates the buffer; releasing one just forgets the index.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use ulid::Ulid;

use super::{Session, SessionError, SessionProvider, SessionResult};
use crate::entity::{Entity, Row, CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN};

/// Operations that can be made to fail with [`MemorySession::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOperation {
    Flush,
    Commit,
    Rollback,
    /// Any of begin / release / rollback-to savepoint.
    Savepoint,
}

impl SessionOperation {
    fn name(&self) -> &'static str {
        match self {
            SessionOperation::Flush => "flush",
            SessionOperation::Commit => "commit",
            SessionOperation::Rollback => "rollback",
            SessionOperation::Savepoint => "savepoint",
        }
    }
}

/// Counters over every session of a [`MemoryDatabase`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Successful commits.
    pub commits: u64,
    /// Successful full rollbacks (savepoint rollbacks not included).
    pub rollbacks: u64,
    /// Flushes that sent at least one change.
    pub flushes: u64,
    /// Sessions handed out.
    pub sessions_opened: u64,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Put { table: String, identity: Ulid, row: Row },
    Delete { table: String, identity: Ulid },
}

impl WriteOp {
    fn targets(&self, table: &str, identity: Ulid) -> bool {
        match self {
            WriteOp::Put {
                table: t,
                identity: i,
                ..
            }
            | WriteOp::Delete {
                table: t,
                identity: i,
            } => t == table && *i == identity,
        }
    }
}

/// An in-process database.
///
/// Clone this to share it - it uses Arc internally.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<MemoryDatabaseInner>,
}

#[derive(Default)]
struct MemoryDatabaseInner {
    tables: RwLock<BTreeMap<String, BTreeMap<Ulid, Row>>>,
    next_id: AtomicI64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    flushes: AtomicU64,
    sessions: AtomicU64,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session on its own transaction.
    pub fn open_session(&self) -> MemorySession {
        let n = self.inner.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        MemorySession {
            id: format!("mem-{}", n),
            db: self.clone(),
            state: Mutex::new(SessionState::default()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Read a committed row.
    pub fn get(&self, table: &str, identity: Ulid) -> Option<Row> {
        self.inner
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(&identity))
            .cloned()
    }

    /// Number of committed rows in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.inner
            .tables
            .read()
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Snapshot of the database counters.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            commits: self.inner.commits.load(Ordering::Relaxed),
            rollbacks: self.inner.rollbacks.load(Ordering::Relaxed),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            sessions_opened: self.inner.sessions.load(Ordering::Relaxed),
        }
    }

    fn next_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn apply(&self, ops: Vec<WriteOp>) {
        let mut tables = self.inner.tables.write();
        for op in ops {
            match op {
                WriteOp::Put {
                    table,
                    identity,
                    row,
                } => {
                    tables.entry(table).or_default().insert(identity, row);
                }
                WriteOp::Delete { table, identity } => {
                    if let Some(rows) = tables.get_mut(&table) {
                        rows.remove(&identity);
                    }
                }
            }
        }
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl SessionProvider for MemoryDatabase {
    /// Every call opens a new session: the owning transaction scope plays
    /// the role of the request.
    async fn session(&self) -> SessionResult<Arc<dyn Session>> {
        Ok(Arc::new(self.open_session()))
    }

    async fn open(&self) -> SessionResult<Arc<dyn Session>> {
        Ok(Arc::new(self.open_session()))
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Default)]
struct SessionState {
    pending: Vec<WriteOp>,
    flushed: Vec<WriteOp>,
    savepoints: Vec<(String, usize)>,
    commits: u64,
    closed: bool,
}

/// A session on a [`MemoryDatabase`].
pub struct MemorySession {
    id: String,
    db: MemoryDatabase,
    state: Mutex<SessionState>,
    failures: Mutex<Vec<SessionOperation>>,
}

impl MemorySession {
    /// Make the next `operation` on this session fail with a database error.
    pub fn fail_next(&self, operation: SessionOperation) {
        self.failures.lock().push(operation);
    }

    /// Number of commits issued through this session.
    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    /// Number of staged, unflushed changes.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of flushed, uncommitted changes.
    pub fn flushed_len(&self) -> usize {
        self.state.lock().flushed.len()
    }

    /// Names of open savepoints, oldest first.
    pub fn savepoint_names(&self) -> Vec<String> {
        self.state
            .lock()
            .savepoints
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Row for the entity as this session sees it.
    pub fn visible(&self, table: &str, identity: Ulid) -> Option<Row> {
        let state = self.state.lock();
        self.visible_in(&state, table, identity)
    }

    /// Check whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn visible_in(&self, state: &SessionState, table: &str, identity: Ulid) -> Option<Row> {
        for op in state.flushed.iter().rev() {
            if op.targets(table, identity) {
                return match op {
                    WriteOp::Put { row, .. } => Some(row.clone()),
                    WriteOp::Delete { .. } => None,
                };
            }
        }
        self.db.get(table, identity)
    }

    fn check(&self, state: &SessionState, operation: SessionOperation) -> SessionResult<()> {
        if state.closed {
            return Err(SessionError::Closed(self.id.clone()));
        }
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|op| *op == operation) {
            failures.remove(pos);
            return Err(SessionError::database(
                operation.name(),
                "injected failure",
            ));
        }
        Ok(())
    }

    fn ensure_open(&self, state: &SessionState) -> SessionResult<()> {
        if state.closed {
            return Err(SessionError::Closed(self.id.clone()));
        }
        Ok(())
    }

    fn stage_put(&self, entity: &dyn Entity) -> SessionResult<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.pending.push(WriteOp::Put {
            table: entity.table().to_string(),
            identity: entity.identity(),
            row: entity.values(),
        });
        Ok(())
    }

    fn stage_delete(&self, entity: &dyn Entity) -> SessionResult<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;

        let table = entity.table().to_string();
        let identity = entity.identity();
        let staged = state.pending.iter().any(|op| op.targets(&table, identity));
        let stored = self.visible_in(&state, &table, identity).is_some();
        if !staged && !stored {
            return Err(SessionError::EntityNotFound { table, identity });
        }

        // Never reached the database: forgetting the staged writes is enough.
        state.pending.retain(|op| !op.targets(&table, identity));
        if stored {
            state.pending.push(WriteOp::Delete { table, identity });
        }
        Ok(())
    }

    fn flush_locked(&self, state: &mut SessionState) -> SessionResult<()> {
        self.check(state, SessionOperation::Flush)?;
        if state.pending.is_empty() {
            return Ok(());
        }

        let now = Value::from(chrono::Utc::now().to_rfc3339());
        for op in std::mem::take(&mut state.pending) {
            match op {
                WriteOp::Put {
                    table,
                    identity,
                    row: values,
                } => {
                    let mut row = match self.visible_in(state, &table, identity) {
                        Some(existing) => existing,
                        None => {
                            let mut row = Row::new();
                            row.insert(ID_COLUMN.to_string(), Value::from(self.db.next_id()));
                            row.insert(CREATED_AT_COLUMN.to_string(), now.clone());
                            row
                        }
                    };
                    for (column, value) in values {
                        if !matches!(
                            column.as_str(),
                            ID_COLUMN | CREATED_AT_COLUMN | UPDATED_AT_COLUMN
                        ) {
                            row.insert(column, value);
                        }
                    }
                    row.insert(UPDATED_AT_COLUMN.to_string(), now.clone());
                    state.flushed.push(WriteOp::Put {
                        table,
                        identity,
                        row,
                    });
                }
                delete @ WriteOp::Delete { .. } => state.flushed.push(delete),
            }
        }

        self.db.inner.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush_sync(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn refresh_sync(&self, entity: &mut dyn Entity) -> SessionResult<()> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        match self.visible_in(&state, entity.table(), entity.identity()) {
            Some(row) => {
                entity.load(&row);
                Ok(())
            }
            None => Err(SessionError::EntityNotFound {
                table: entity.table().to_string(),
                identity: entity.identity(),
            }),
        }
    }

    fn commit_sync(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        self.check(&state, SessionOperation::Commit)?;
        self.flush_locked(&mut state)?;

        let ops = std::mem::take(&mut state.flushed);
        state.savepoints.clear();
        state.commits += 1;
        self.db.apply(ops);
        Ok(())
    }

    fn rollback_sync(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        self.check(&state, SessionOperation::Rollback)?;
        state.pending.clear();
        state.flushed.clear();
        state.savepoints.clear();
        self.db.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn begin_savepoint_sync(&self, name: &str) -> SessionResult<()> {
        let mut state = self.state.lock();
        self.check(&state, SessionOperation::Savepoint)?;
        if state.savepoints.iter().any(|(n, _)| n == name) {
            return Err(SessionError::SavepointExists(name.to_string()));
        }
        self.flush_locked(&mut state)?;
        let mark = state.flushed.len();
        state.savepoints.push((name.to_string(), mark));
        Ok(())
    }

    fn savepoint_position(&self, state: &SessionState, name: &str) -> SessionResult<usize> {
        state
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| SessionError::SavepointNotFound(name.to_string()))
    }

    fn release_savepoint_sync(&self, name: &str) -> SessionResult<()> {
        let mut state = self.state.lock();
        self.check(&state, SessionOperation::Savepoint)?;
        let pos = self.savepoint_position(&state, name)?;
        state.savepoints.truncate(pos);
        Ok(())
    }

    fn rollback_to_savepoint_sync(&self, name: &str) -> SessionResult<()> {
        let mut state = self.state.lock();
        self.check(&state, SessionOperation::Savepoint)?;
        let pos = self.savepoint_position(&state, name)?;
        let mark = state.savepoints[pos].1;
        state.pending.clear();
        state.flushed.truncate(mark);
        state.savepoints.truncate(pos);
        Ok(())
    }

    fn close_sync(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.flushed.clear();
        state.savepoints.clear();
        state.closed = true;
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add(&self, entity: &dyn Entity) -> SessionResult<()> {
        self.stage_put(entity)
    }

    async fn remove(&self, entity: &dyn Entity) -> SessionResult<()> {
        self.stage_delete(entity)
    }

    async fn flush(&self) -> SessionResult<()> {
        self.flush_sync()
    }

    async fn refresh(&self, entity: &mut dyn Entity) -> SessionResult<()> {
        self.refresh_sync(entity)
    }

    async fn commit(&self) -> SessionResult<()> {
        self.commit_sync()
    }

    async fn rollback(&self) -> SessionResult<()> {
        self.rollback_sync()
    }

    async fn begin_savepoint(&self, name: &str) -> SessionResult<()> {
        self.begin_savepoint_sync(name)
    }

    async fn release_savepoint(&self, name: &str) -> SessionResult<()> {
        self.release_savepoint_sync(name)
    }

    async fn rollback_to_savepoint(&self, name: &str) -> SessionResult<()> {
        self.rollback_to_savepoint_sync(name)
    }

    async fn close(&self) -> SessionResult<()> {
        self.close_sync();
        Ok(())
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("pending", &state.pending.len())
            .field("flushed", &state.flushed.len())
            .field("savepoints", &state.savepoints.len())
            .field("closed", &state.closed)
            .finish()
    }
}
