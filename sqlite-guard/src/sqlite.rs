//! Safe `SQLite` backend.
//!
//! This file contains **no `unsafe` code**. All FFI interaction is delegated
//! to [`ffi::RawDb`] which encapsulates the raw pointers and C type
//! conversions.

use std::os::raw::c_int;
use std::path::Path;

use crate::error::{DbError, DbResult};
use crate::ffi::{self, RawDb};
use crate::native::{NativeDb, StmtPtr};
use crate::value::{ColumnType, Value};

/// Result of a single `sqlite3_step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A result row is available.
    Row,
    /// The statement has finished executing.
    Done,
}

/// A native `SQLite` database handle.
///
/// Statement operations take the [`StmtPtr`] returned by
/// [`prepare`](Self::prepare). Pointers this handle did not prepare, or has
/// already finalized, are rejected with `SQLITE_MISUSE`.
pub struct SqliteDb {
    raw: RawDb,
}

impl SqliteDb {
    /// Opens (or creates) a database at `path`.
    ///
    /// The handle is always opened in serialized (`FULLMUTEX`) mode.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure if the file cannot be opened.
    pub fn open(path: &Path, read_only: bool) -> DbResult<Self> {
        let flags = if read_only {
            ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_FULLMUTEX
        } else {
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_FULLMUTEX
        };
        let raw = RawDb::open(&path.to_string_lossy(), flags)?;
        Ok(Self { raw })
    }

    /// Executes one or more SQL statements separated by semicolons.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure for the first statement that fails.
    pub fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        self.raw.exec(sql)
    }

    /// Compiles a single SQL statement.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure if the SQL does not compile.
    pub fn prepare(&mut self, sql: &str) -> DbResult<StmtPtr> {
        self.raw.prepare(sql)
    }

    /// Returns `true` if `stmt` is a live statement of this handle.
    #[must_use]
    pub fn owns(&self, stmt: StmtPtr) -> bool {
        self.raw.owns(stmt)
    }

    /// Number of prepared statements not yet finalized.
    #[must_use]
    pub fn live_statements(&self) -> usize {
        self.raw.live_statements()
    }

    /// Sets how long a locked database is retried before `SQLITE_BUSY`.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure, or `SQLITE_MISUSE` if `ms` overflows.
    pub fn busy_timeout(&mut self, ms: u32) -> DbResult<()> {
        let ms = c_int::try_from(ms)
            .map_err(|_| DbError::native(ffi::SQLITE_MISUSE, "busy timeout out of range"))?;
        self.raw.busy_timeout(ms)
    }

    /// Number of rows changed by the most recent statement.
    ///
    /// # Errors
    ///
    /// Fails only if the handle is closed.
    pub fn changes(&self) -> DbResult<usize> {
        count(self.raw.changes()?, "change count")
    }

    /// Rowid of the most recent successful INSERT.
    ///
    /// # Errors
    ///
    /// Fails only if the handle is closed.
    pub fn last_insert_rowid(&self) -> DbResult<i64> {
        self.raw.last_insert_rowid()
    }

    // ── Statement operations ────────────────────────────────────────────

    /// Binds a slice of [`Value`]s to the statement parameters (1-indexed).
    ///
    /// # Errors
    ///
    /// Fails on a count mismatch or if the engine rejects a binding.
    pub fn bind_values(&mut self, stmt: StmtPtr, values: &[Value]) -> DbResult<()> {
        let expected = self.raw.bind_parameter_count(stmt)?;
        if usize::try_from(expected).ok() != Some(values.len()) {
            return Err(DbError::native(
                ffi::SQLITE_MISUSE,
                format!("expected {expected} parameters, got {}", values.len()),
            ));
        }
        self.raw.clear_bindings(stmt)?;
        for (i, val) in values.iter().enumerate() {
            let idx = param_index(i + 1)?;
            match val {
                Value::Integer(v) => self.raw.bind_i64(stmt, idx, *v)?,
                Value::Real(v) => self.raw.bind_f64(stmt, idx, *v)?,
                Value::Blob(v) => self.raw.bind_blob(stmt, idx, v)?,
                Value::Text(v) => self.raw.bind_text(stmt, idx, v)?,
                Value::Null => self.raw.bind_null(stmt, idx)?,
            }
        }
        Ok(())
    }

    /// Executes a single step.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure if the step does not yield a row or
    /// complete.
    pub fn step(&mut self, stmt: StmtPtr) -> DbResult<StepResult> {
        if self.raw.step(stmt)? == ffi::SQLITE_ROW {
            Ok(StepResult::Row)
        } else {
            Ok(StepResult::Done)
        }
    }

    /// Resets the statement so it can be stepped again.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure.
    pub fn reset(&mut self, stmt: StmtPtr) -> DbResult<()> {
        self.raw.reset(stmt)
    }

    /// Number of columns in the result set.
    ///
    /// # Errors
    ///
    /// Fails if `stmt` is not live.
    pub fn column_count(&self, stmt: StmtPtr) -> DbResult<usize> {
        count(self.raw.column_count(stmt)?, "column count")
    }

    /// Storage class of column `idx` in the current row.
    ///
    /// # Errors
    ///
    /// Fails if `stmt` is not live or the engine reports an unknown type.
    pub fn column_type(&self, stmt: StmtPtr, idx: usize) -> DbResult<ColumnType> {
        match self.raw.column_type(stmt, column_index(idx)?)? {
            ffi::SQLITE_INTEGER => Ok(ColumnType::Integer),
            ffi::SQLITE_FLOAT => Ok(ColumnType::Real),
            ffi::SQLITE_TEXT => Ok(ColumnType::Text),
            ffi::SQLITE_BLOB => Ok(ColumnType::Blob),
            ffi::SQLITE_NULL => Ok(ColumnType::Null),
            other => Err(DbError::native(
                ffi::SQLITE_MISUSE,
                format!("unknown column type {other}"),
            )),
        }
    }

    /// Reads a column as `i64`.
    ///
    /// # Errors
    ///
    /// Fails if `stmt` is not live.
    pub fn column_i64(&self, stmt: StmtPtr, idx: usize) -> DbResult<i64> {
        self.raw.column_i64(stmt, column_index(idx)?)
    }

    /// Reads a column as `f64`.
    ///
    /// # Errors
    ///
    /// Fails if `stmt` is not live.
    pub fn column_f64(&self, stmt: StmtPtr, idx: usize) -> DbResult<f64> {
        self.raw.column_f64(stmt, column_index(idx)?)
    }

    /// Reads a column as a blob. Returns an empty `Vec` for NULL.
    ///
    /// # Errors
    ///
    /// Fails if `stmt` is not live.
    pub fn column_blob(&self, stmt: StmtPtr, idx: usize) -> DbResult<Vec<u8>> {
        self.raw.column_blob(stmt, column_index(idx)?)
    }

    /// Reads a column as a UTF-8 string. Returns an empty string for NULL.
    ///
    /// # Errors
    ///
    /// Fails if `stmt` is not live.
    pub fn column_text(&self, stmt: StmtPtr, idx: usize) -> DbResult<String> {
        self.raw.column_text(stmt, column_index(idx)?)
    }
}

/// The current result row of a statement.
///
/// Only handed out inside a unit of work, so the connection lock is held for
/// as long as the row is reachable.
pub struct Row<'a> {
    db: &'a SqliteDb,
    stmt: StmtPtr,
}

impl<'a> Row<'a> {
    pub(crate) const fn new(db: &'a SqliteDb, stmt: StmtPtr) -> Self {
        Self { db, stmt }
    }

    /// Number of columns in the row.
    ///
    /// # Errors
    ///
    /// Fails if the statement is no longer live.
    pub fn column_count(&self) -> DbResult<usize> {
        self.db.column_count(self.stmt)
    }

    /// Storage class of column `idx`.
    ///
    /// # Errors
    ///
    /// Fails if the statement is no longer live.
    pub fn column_type(&self, idx: usize) -> DbResult<ColumnType> {
        self.db.column_type(self.stmt, idx)
    }

    /// Returns `true` if the column is SQL NULL.
    ///
    /// # Errors
    ///
    /// Fails if the statement is no longer live.
    pub fn is_column_null(&self, idx: usize) -> DbResult<bool> {
        Ok(self.column_type(idx)? == ColumnType::Null)
    }

    /// Reads a column as `i64`.
    ///
    /// # Errors
    ///
    /// Fails if the statement is no longer live.
    pub fn column_i64(&self, idx: usize) -> DbResult<i64> {
        self.db.column_i64(self.stmt, idx)
    }

    /// Reads a column as `f64`.
    ///
    /// # Errors
    ///
    /// Fails if the statement is no longer live.
    pub fn column_f64(&self, idx: usize) -> DbResult<f64> {
        self.db.column_f64(self.stmt, idx)
    }

    /// Reads a column as a blob. Returns an empty `Vec` for NULL.
    ///
    /// # Errors
    ///
    /// Fails if the statement is no longer live.
    pub fn column_blob(&self, idx: usize) -> DbResult<Vec<u8>> {
        self.db.column_blob(self.stmt, idx)
    }

    /// Reads a column as a UTF-8 string. Returns an empty string for NULL.
    ///
    /// # Errors
    ///
    /// Fails if the statement is no longer live.
    pub fn column_text(&self, idx: usize) -> DbResult<String> {
        self.db.column_text(self.stmt, idx)
    }
}

impl NativeDb for SqliteDb {
    fn finalize(&mut self, stmt: StmtPtr) -> DbResult<i32> {
        self.raw.finalize(stmt)
    }

    fn close(&mut self) -> DbResult<()> {
        self.raw.close()
    }
}

impl std::fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDb")
            .field("live_statements", &self.raw.live_statements())
            .finish_non_exhaustive()
    }
}

fn param_index(idx: usize) -> DbResult<c_int> {
    c_int::try_from(idx)
        .map_err(|_| DbError::native(ffi::SQLITE_MISUSE, "parameter index overflow"))
}

fn column_index(idx: usize) -> DbResult<c_int> {
    c_int::try_from(idx)
        .map_err(|_| DbError::native(ffi::SQLITE_MISUSE, "column index overflow"))
}

fn count(n: c_int, what: &str) -> DbResult<usize> {
    usize::try_from(n)
        .map_err(|_| DbError::native(ffi::SQLITE_MISUSE, format!("negative {what}: {n}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbErrorCode;

    #[test]
    fn count_converts_non_negative_values() {
        assert_eq!(count(0, "column count"), Ok(0));
        assert_eq!(count(3, "column count"), Ok(3));
    }

    #[test]
    fn negative_count_is_reported_not_zeroed() {
        let err = count(-1, "change count").unwrap_err();
        assert_eq!(err.code(), Some(DbErrorCode(ffi::SQLITE_MISUSE)));
        assert_eq!(err.to_string(), "sqlite error 21: negative change count: -1");
    }
}
