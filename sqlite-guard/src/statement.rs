//! Safe, shareable wrapper around a native statement pointer.
//!
//! This file contains **no `unsafe` code**.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::connection::Connection;
use crate::error::{DbError, DbResult};
use crate::native::{NativeDb, StmtPtr};
use crate::sqlite::{SqliteDb, StepResult};
use crate::value::{ColumnType, Value};

/// Per-statement state shared between a [`SafeStatement`] and its
/// connection's registry.
///
/// Written only under the connection lock; readable without it.
#[derive(Debug)]
pub(crate) struct StatementState {
    ptr: StmtPtr,
    closed: AtomicBool,
    /// Published before `closed` is set.
    outcome: OnceLock<DbResult<i32>>,
}

impl StatementState {
    pub(crate) const fn new(ptr: StmtPtr) -> Self {
        Self {
            ptr,
            closed: AtomicBool::new(false),
            outcome: OnceLock::new(),
        }
    }

    pub(crate) const fn ptr(&self) -> StmtPtr {
        self.ptr
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::AlreadyClosed);
        }
        Ok(())
    }

    /// The recorded close outcome, once closed.
    pub(crate) fn outcome(&self) -> Option<DbResult<i32>> {
        if !self.is_closed() {
            return None;
        }
        self.outcome.get().cloned()
    }

    /// Finalizes the pointer unless already closed, recording the outcome.
    ///
    /// Must be called with the connection lock held.
    pub(crate) fn close_with<D: NativeDb>(&self, db: &mut D) -> DbResult<i32> {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        let outcome = db.finalize(self.ptr);
        match &outcome {
            Ok(code) => tracing::debug!(stmt = %self.ptr, code, "finalized statement"),
            Err(err) => tracing::debug!(stmt = %self.ptr, %err, "finalize failed"),
        }
        // The lock is held and no outcome was recorded, so the cell is empty.
        let recorded = self.outcome.set(outcome.clone());
        debug_assert!(recorded.is_ok(), "close outcome recorded twice");
        self.closed.store(true, Ordering::Release);
        outcome
    }
}

/// A statement pointer that may be shared across threads.
///
/// Every native call made through it, including finalization, runs under the
/// owning [`Connection`]'s lock. [`close`](Self::close) finalizes the pointer
/// at most once; later calls replay the first outcome. Once closed, the
/// handle still reports its [`pointer`](Self::pointer) and
/// [`close_outcome`](Self::close_outcome) but rejects further work with
/// [`DbError::AlreadyClosed`].
///
/// Two handles are equal when they wrap the same pointer value. Handles
/// adopting a pointer that is still open share its close state.
///
/// An open handle is closed when dropped.
pub struct SafeStatement<'conn, D: NativeDb = SqliteDb> {
    conn: &'conn Connection<D>,
    state: Arc<StatementState>,
}

impl<'conn, D: NativeDb> SafeStatement<'conn, D> {
    /// Adopts a native statement pointer belonging to `conn`.
    ///
    /// The connection finalizes it on teardown if it is still open then.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ConnectionClosed`] or [`DbError::LockPoisoned`].
    pub fn new(conn: &'conn Connection<D>, ptr: StmtPtr) -> DbResult<Self> {
        let state = conn.register(ptr)?;
        Ok(Self::from_state(conn, state))
    }

    pub(crate) fn from_state(conn: &'conn Connection<D>, state: Arc<StatementState>) -> Self {
        Self { conn, state }
    }

    /// The wrapped native pointer value.
    #[must_use]
    pub fn pointer(&self) -> StmtPtr {
        self.state.ptr()
    }

    /// The connection this statement belongs to.
    #[must_use]
    pub const fn connection(&self) -> &'conn Connection<D> {
        self.conn
    }

    /// Whether this pointer has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// The recorded outcome of the close, or `None` while open.
    #[must_use]
    pub fn close_outcome(&self) -> Option<DbResult<i32>> {
        self.state.outcome()
    }

    /// Fails if the pointer has been closed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::AlreadyClosed`].
    pub fn ensure_open(&self) -> DbResult<()> {
        self.state.ensure_open()
    }

    /// Runs `task` with the native handle and the wrapped pointer while
    /// holding the connection lock.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::AlreadyClosed`] without calling `task` if the
    /// pointer is closed, otherwise whatever `task` returns.
    pub fn safe_run<T>(&self, task: impl FnOnce(&mut D, StmtPtr) -> DbResult<T>) -> DbResult<T> {
        self.conn.run_statement(&self.state, task)
    }

    /// Like [`safe_run`](Self::safe_run) for native calls that report a raw
    /// status code.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::AlreadyClosed`] without calling `task` if the
    /// pointer is closed.
    pub fn safe_run_value(&self, task: impl FnOnce(&mut D, StmtPtr) -> i32) -> DbResult<i32> {
        self.conn.run_statement(&self.state, |db, ptr| Ok(task(db, ptr)))
    }

    /// Finalizes the pointer and returns the engine's status code.
    ///
    /// Only the first call reaches the engine. Every later call, from any
    /// thread, returns the same status or hands back the same failure.
    ///
    /// # Errors
    ///
    /// Returns the finalize failure recorded by the first close, or
    /// [`DbError::LockPoisoned`] if the close could not be attempted.
    pub fn close(&self) -> DbResult<i32> {
        self.conn.close_statement(&self.state)
    }
}

impl SafeStatement<'_, SqliteDb> {
    /// Binds a slice of [`Value`]s to the statement parameters (1-indexed).
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer or a rejected binding.
    pub fn bind_values(&self, values: &[Value]) -> DbResult<()> {
        self.safe_run(|db, ptr| db.bind_values(ptr, values))
    }

    /// Executes a single step.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer or an engine failure.
    pub fn step(&self) -> DbResult<StepResult> {
        self.safe_run(|db, ptr| db.step(ptr))
    }

    /// Resets the statement so it can be stepped again.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer or an engine failure.
    pub fn reset(&self) -> DbResult<()> {
        self.safe_run(|db, ptr| db.reset(ptr))
    }

    /// Number of columns in the result set.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer.
    pub fn column_count(&self) -> DbResult<usize> {
        self.safe_run(|db, ptr| db.column_count(ptr))
    }

    /// Storage class of column `idx` in the current row.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer.
    pub fn column_type(&self, idx: usize) -> DbResult<ColumnType> {
        self.safe_run(|db, ptr| db.column_type(ptr, idx))
    }

    /// Returns `true` if the column is SQL NULL.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer.
    pub fn is_column_null(&self, idx: usize) -> DbResult<bool> {
        Ok(self.column_type(idx)? == ColumnType::Null)
    }

    /// Reads a column as `i64`.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer.
    pub fn column_i64(&self, idx: usize) -> DbResult<i64> {
        self.safe_run(|db, ptr| db.column_i64(ptr, idx))
    }

    /// Reads a column as `f64`.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer.
    pub fn column_f64(&self, idx: usize) -> DbResult<f64> {
        self.safe_run(|db, ptr| db.column_f64(ptr, idx))
    }

    /// Reads a column as a blob. Returns an empty `Vec` for NULL.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer.
    pub fn column_blob(&self, idx: usize) -> DbResult<Vec<u8>> {
        self.safe_run(|db, ptr| db.column_blob(ptr, idx))
    }

    /// Reads a column as a UTF-8 string. Returns an empty string for NULL.
    ///
    /// # Errors
    ///
    /// Fails on a closed pointer.
    pub fn column_text(&self, idx: usize) -> DbResult<String> {
        self.safe_run(|db, ptr| db.column_text(ptr, idx))
    }
}

impl<D: NativeDb> Drop for SafeStatement<'_, D> {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.close() {
            tracing::warn!(stmt = %self.pointer(), %err, "failed to close statement on drop");
        }
    }
}

impl<D: NativeDb> PartialEq for SafeStatement<'_, D> {
    fn eq(&self, other: &Self) -> bool {
        self.pointer() == other.pointer()
    }
}

impl<D: NativeDb> Eq for SafeStatement<'_, D> {}

impl<D: NativeDb> Hash for SafeStatement<'_, D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pointer().hash(state);
    }
}

impl<D: NativeDb> std::fmt::Debug for SafeStatement<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeStatement")
            .field("pointer", &self.pointer())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
