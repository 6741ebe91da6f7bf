//! A native database handle shared behind one lock.
//!
//! This file contains **no `unsafe` code**.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::ConnectionConfig;
use crate::error::{DbError, DbResult};
use crate::ffi;
use crate::native::{NativeDb, StmtPtr};
use crate::sqlite::{Row, SqliteDb, StepResult};
use crate::statement::{SafeStatement, StatementState};
use crate::value::Value;

/// A database connection.
///
/// Owns the native handle `D` and serializes every native call behind a
/// single mutex. Statements borrow the connection, so it outlives all of
/// them. Torn down by [`close`](Self::close) or when dropped.
pub struct Connection<D: NativeDb = SqliteDb> {
    inner: Mutex<Inner<D>>,
}

/// State guarded by the connection lock.
struct Inner<D> {
    /// `None` once the connection has been torn down.
    db: Option<D>,
    /// Shared state of every statement not yet closed.
    statements: Vec<Arc<StatementState>>,
}

impl<D> Inner<D> {
    fn db(&mut self) -> DbResult<&mut D> {
        self.db.as_mut().ok_or(DbError::ConnectionClosed)
    }

    /// Returns the open state for `ptr`, creating it if none exists.
    ///
    /// Handles adopting the same pointer share one state, so the pointer is
    /// finalized at most once.
    fn track(&mut self, ptr: StmtPtr) -> Arc<StatementState> {
        if let Some(state) = self.statements.iter().find(|s| s.ptr() == ptr) {
            return Arc::clone(state);
        }
        let state = Arc::new(StatementState::new(ptr));
        self.statements.push(Arc::clone(&state));
        state
    }
}

impl<D: NativeDb> Connection<D> {
    /// Wraps an already opened native handle.
    pub fn from_native(db: D) -> Self {
        Self {
            inner: Mutex::new(Inner {
                db: Some(db),
                statements: Vec::new(),
            }),
        }
    }

    /// Runs `task` with exclusive access to the native handle.
    ///
    /// The lock is released on every exit path, including a panic inside
    /// `task`. The task's result or failure is returned unchanged.
    ///
    /// `task` must not call back into this connection; the lock is not
    /// reentrant.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ConnectionClosed`] after teardown,
    /// [`DbError::LockPoisoned`] if an earlier task panicked, or whatever
    /// `task` returns.
    pub fn use_db<T>(&self, task: impl FnOnce(&mut D) -> DbResult<T>) -> DbResult<T> {
        self.with_inner(|inner| task(inner.db()?))
    }

    /// Finalizes every open statement, then closes the native handle.
    ///
    /// Each statement goes through its regular close path, so it finalizes
    /// at most once and later replays the outcome recorded here. Every
    /// statement is attempted; the first failure is returned. Further calls
    /// do nothing.
    ///
    /// # Errors
    ///
    /// Returns the first finalize or close failure, or
    /// [`DbError::LockPoisoned`].
    pub fn close(&self) -> DbResult<()> {
        self.with_inner(|inner| {
            let Some(mut db) = inner.db.take() else {
                return Ok(());
            };
            tracing::debug!(open = inner.statements.len(), "tearing down connection");
            let mut first_err = None;
            for state in inner.statements.drain(..) {
                if let Err(err) = state.close_with(&mut db) {
                    tracing::warn!(stmt = %state.ptr(), %err, "finalize failed during teardown");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
            if let Err(err) = db.close() {
                tracing::warn!(%err, "native close failed");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }

    /// Returns `true` once the connection has been torn down.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LockPoisoned`].
    pub fn is_closed(&self) -> DbResult<bool> {
        self.with_inner(|inner| Ok(inner.db.is_none()))
    }

    /// Number of statements created from this connection and not yet closed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LockPoisoned`].
    pub fn open_statements(&self) -> DbResult<usize> {
        self.with_inner(|inner| Ok(inner.statements.len()))
    }

    // ── Statement plumbing ──────────────────────────────────────────────

    /// Starts tracking an adopted statement pointer.
    pub(crate) fn register(&self, ptr: StmtPtr) -> DbResult<Arc<StatementState>> {
        self.with_inner(|inner| {
            inner.db()?;
            Ok(inner.track(ptr))
        })
    }

    /// Runs `task` on an open statement. The open check happens under the
    /// lock, so a close that completed first is always observed.
    pub(crate) fn run_statement<T>(
        &self,
        state: &StatementState,
        task: impl FnOnce(&mut D, StmtPtr) -> DbResult<T>,
    ) -> DbResult<T> {
        self.with_inner(|inner| {
            state.ensure_open()?;
            task(inner.db()?, state.ptr())
        })
    }

    /// Closes a statement through the lock and stops tracking it.
    pub(crate) fn close_statement(&self, state: &Arc<StatementState>) -> DbResult<i32> {
        self.with_inner(|inner| {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            let outcome = state.close_with(inner.db()?);
            inner.statements.retain(|s| !Arc::ptr_eq(s, state));
            outcome
        })
    }

    fn with_inner<T>(&self, task: impl FnOnce(&mut Inner<D>) -> DbResult<T>) -> DbResult<T> {
        let mut guard = self.inner.lock().map_err(|_| DbError::LockPoisoned)?;
        task(&mut guard)
    }
}

impl Connection<SqliteDb> {
    /// Opens (or creates) a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure if the file cannot be opened.
    pub fn open(path: &Path, read_only: bool) -> DbResult<Self> {
        let db = SqliteDb::open(path, read_only)?;
        tracing::debug!(path = %path.display(), read_only, "opened database");
        Ok(Self::from_native(db))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure.
    pub fn open_in_memory() -> DbResult<Self> {
        Self::open(Path::new(":memory:"), false)
    }

    /// Opens a database and applies `config`.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure, or `SQLITE_MISUSE` for an invalid
    /// configuration value.
    pub fn open_with(config: &ConnectionConfig) -> DbResult<Self> {
        let pragmas = config.pragmas()?;
        let conn = Self::open(&config.path, config.read_only)?;
        conn.use_db(|db| {
            if let Some(ms) = config.busy_timeout_ms {
                db.busy_timeout(ms)?;
            }
            db.execute_batch(&pragmas)
        })?;
        Ok(conn)
    }

    /// Executes one or more SQL statements separated by semicolons.
    ///
    /// No result rows are returned. Suitable for DDL, PRAGMAs, and
    /// multi-statement scripts.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure.
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.use_db(|db| db.execute_batch(sql))
    }

    /// Prepares a single SQL statement.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure if the SQL does not compile.
    pub fn prepare(&self, sql: &str) -> DbResult<SafeStatement<'_>> {
        let state = self.with_inner(|inner| {
            let ptr = inner.db()?.prepare(sql)?;
            tracing::debug!(stmt = %ptr, "prepared statement");
            Ok(inner.track(ptr))
        })?;
        Ok(SafeStatement::from_state(self, state))
    }

    /// Prepares and executes a single statement with the given parameters.
    ///
    /// Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure.
    pub fn execute(&self, sql: &str, params: &[Value]) -> DbResult<usize> {
        let stmt = self.prepare(sql)?;
        let changed = stmt.safe_run(|db, ptr| {
            db.bind_values(ptr, params)?;
            db.step(ptr)?;
            db.changes()
        });
        finish(&stmt, changed)
    }

    /// Prepares and executes a statement, mapping exactly one result row.
    ///
    /// `mapper` runs under the connection lock.
    ///
    /// # Errors
    ///
    /// Returns `SQLITE_DONE` if no row is returned, or the engine's failure.
    pub fn query_row<T>(
        &self,
        sql: &str,
        params: &[Value],
        mapper: impl FnOnce(&Row<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        self.query_row_optional(sql, params, mapper)?
            .ok_or_else(|| DbError::native(ffi::SQLITE_DONE, "query returned no rows"))
    }

    /// Like [`query_row`](Self::query_row) but returns `Ok(None)` when no row
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure.
    pub fn query_row_optional<T>(
        &self,
        sql: &str,
        params: &[Value],
        mapper: impl FnOnce(&Row<'_>) -> DbResult<T>,
    ) -> DbResult<Option<T>> {
        let stmt = self.prepare(sql)?;
        let row = stmt.safe_run(|db, ptr| {
            db.bind_values(ptr, params)?;
            match db.step(ptr)? {
                StepResult::Row => mapper(&Row::new(db, ptr)).map(Some),
                StepResult::Done => Ok(None),
            }
        });
        finish(&stmt, row)
    }

    /// Prepares a statement and collects all matching rows.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure or the first mapper failure.
    pub fn query_map<T>(
        &self,
        sql: &str,
        params: &[Value],
        mut mapper: impl FnMut(&Row<'_>) -> DbResult<T>,
    ) -> DbResult<Vec<T>> {
        let stmt = self.prepare(sql)?;
        let rows = stmt.safe_run(|db, ptr| {
            db.bind_values(ptr, params)?;
            let mut rows = Vec::new();
            while db.step(ptr)? == StepResult::Row {
                rows.push(mapper(&Row::new(db, ptr))?);
            }
            Ok(rows)
        });
        finish(&stmt, rows)
    }

    /// Returns the rowid of the most recent successful INSERT.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed.
    pub fn last_insert_rowid(&self) -> DbResult<i64> {
        self.use_db(|db| db.last_insert_rowid())
    }

    /// Returns the number of rows changed by the most recent statement.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed.
    pub fn changes(&self) -> DbResult<usize> {
        self.use_db(|db| db.changes())
    }
}

/// Closes a one-shot statement, preferring the statement's own failure.
fn finish<T>(stmt: &SafeStatement<'_>, result: DbResult<T>) -> DbResult<T> {
    let closed = stmt.close();
    let value = result?;
    closed?;
    Ok(value)
}

impl<D: NativeDb> Drop for Connection<D> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(%err, "failed to tear down connection");
        }
    }
}

impl<D: NativeDb> std::fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}
