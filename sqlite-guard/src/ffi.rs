//! Raw FFI layer over the `SQLite` C API provided by `libsqlite3-sys`.
//!
//! This is the **only** module that contains `unsafe` code or C types. The
//! rest of the crate talks to [`RawDb`], which owns the `sqlite3*` handle and
//! refuses to touch any statement pointer it did not prepare itself.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;

use libsqlite3_sys as sys;

use crate::error::{DbError, DbResult};
use crate::native::StmtPtr;

// `sqlite3_close_v2` is compiled into the bundled library but omitted from
// the pre-generated `libsqlite3-sys` bindings, so declare it here.
extern "C" {
    fn sqlite3_close_v2(db: *mut sys::sqlite3) -> c_int;
}

pub use sys::{
    SQLITE_BLOB, SQLITE_DONE, SQLITE_ERROR, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_MISUSE,
    SQLITE_NULL, SQLITE_OK, SQLITE_OPEN_CREATE, SQLITE_OPEN_FULLMUTEX, SQLITE_OPEN_READONLY,
    SQLITE_OPEN_READWRITE, SQLITE_ROW, SQLITE_TEXT, SQLITE_TOOBIG,
};

/// Owner of a raw `sqlite3*` handle.
///
/// Tracks every statement it prepared and has not yet finalized. Operations
/// on any other pointer value fail with `SQLITE_MISUSE` before reaching C.
pub struct RawDb {
    db: *mut sys::sqlite3,
    live: HashSet<StmtPtr>,
}

// SAFETY: the handle is opened with SQLITE_OPEN_FULLMUTEX and every access
// goes through `&mut self`, which the owning `Connection` only hands out
// while holding its mutex.
unsafe impl Send for RawDb {}

impl RawDb {
    /// Opens (or creates) the database at `path` with the given open flags.
    pub fn open(path: &str, flags: c_int) -> DbResult<Self> {
        let c_path = CString::new(path)
            .map_err(|e| DbError::native(SQLITE_ERROR, format!("invalid path: {e}")))?;
        let mut db: *mut sys::sqlite3 = ptr::null_mut();
        // SAFETY: `c_path` is a valid NUL-terminated string and `db` is a
        // valid out-pointer.
        let rc = unsafe { sys::sqlite3_open_v2(c_path.as_ptr(), &raw mut db, flags, ptr::null()) };
        if rc != SQLITE_OK {
            let msg = if db.is_null() {
                format!("sqlite3_open_v2 returned {rc}")
            } else {
                let msg = errmsg_raw(db);
                // SAFETY: `db` was returned by sqlite3_open_v2 and is closed once.
                unsafe { sqlite3_close_v2(db) };
                msg
            };
            return Err(DbError::native(rc, msg));
        }
        Ok(Self {
            db,
            live: HashSet::new(),
        })
    }

    /// Finalizes every statement still tracked and closes the handle.
    ///
    /// Subsequent calls are no-ops.
    pub fn close(&mut self) -> DbResult<()> {
        if self.db.is_null() {
            return Ok(());
        }
        for stmt in std::mem::take(&mut self.live) {
            // SAFETY: pointers in `live` came from sqlite3_prepare_v2 on this
            // handle and have not been finalized.
            unsafe { sys::sqlite3_finalize(to_raw(stmt)) };
        }
        // SAFETY: `self.db` is a live handle; it is nulled right after.
        let rc = unsafe { sqlite3_close_v2(self.db) };
        if rc != SQLITE_OK {
            return Err(self.last_error(rc));
        }
        self.db = ptr::null_mut();
        Ok(())
    }

    /// Runs one or more semicolon-separated statements, discarding rows.
    pub fn exec(&mut self, sql: &str) -> DbResult<()> {
        let db = self.handle()?;
        let c_sql = CString::new(sql)
            .map_err(|e| DbError::native(SQLITE_ERROR, format!("nul in SQL: {e}")))?;
        let mut errmsg: *mut c_char = ptr::null_mut();
        // SAFETY: `db` is live, `c_sql` is NUL-terminated, no callback is
        // registered and `errmsg` is a valid out-pointer.
        let rc = unsafe {
            sys::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &raw mut errmsg)
        };
        if rc != SQLITE_OK {
            let msg = if errmsg.is_null() {
                errmsg_raw(db)
            } else {
                // SAFETY: sqlite allocated `errmsg` as a NUL-terminated string;
                // it is copied before being released with sqlite3_free.
                unsafe {
                    let s = CStr::from_ptr(errmsg).to_string_lossy().into_owned();
                    sys::sqlite3_free(errmsg.cast());
                    s
                }
            };
            return Err(DbError::native(rc, msg));
        }
        Ok(())
    }

    /// Compiles a single statement and starts tracking its pointer.
    pub fn prepare(&mut self, sql: &str) -> DbResult<StmtPtr> {
        let db = self.handle()?;
        let c_sql = CString::new(sql)
            .map_err(|e| DbError::native(SQLITE_ERROR, format!("nul in SQL: {e}")))?;
        let mut stmt: *mut sys::sqlite3_stmt = ptr::null_mut();
        // SAFETY: `db` is live, `c_sql` is NUL-terminated and `stmt` is a
        // valid out-pointer. The tail pointer is not requested.
        let rc = unsafe {
            sys::sqlite3_prepare_v2(db, c_sql.as_ptr(), -1, &raw mut stmt, ptr::null_mut())
        };
        if rc != SQLITE_OK {
            return Err(self.last_error(rc));
        }
        if stmt.is_null() {
            return Err(DbError::native(SQLITE_MISUSE, "no statement in SQL text"));
        }
        let ptr = StmtPtr::new(stmt.expose_provenance());
        self.live.insert(ptr);
        Ok(ptr)
    }

    /// Destroys a statement. Returns `SQLITE_OK` on success.
    pub fn finalize(&mut self, stmt: StmtPtr) -> DbResult<c_int> {
        let db = self.handle()?;
        if !self.live.remove(&stmt) {
            return Err(not_owned(stmt));
        }
        // SAFETY: `stmt` was prepared on `db` and is removed from `live`
        // before this call, so it is finalized exactly once.
        let rc = unsafe { sys::sqlite3_finalize(to_raw(stmt)) };
        if rc != SQLITE_OK {
            return Err(DbError::native(rc, errmsg_raw(db)));
        }
        Ok(rc)
    }

    /// Returns `true` if `stmt` was prepared here and not yet finalized.
    pub fn owns(&self, stmt: StmtPtr) -> bool {
        self.live.contains(&stmt)
    }

    /// Returns the number of tracked statements.
    pub fn live_statements(&self) -> usize {
        self.live.len()
    }

    /// Sets the busy handler timeout in milliseconds.
    pub fn busy_timeout(&mut self, ms: c_int) -> DbResult<()> {
        let db = self.handle()?;
        // SAFETY: `db` is live.
        let rc = unsafe { sys::sqlite3_busy_timeout(db, ms) };
        if rc != SQLITE_OK {
            return Err(self.last_error(rc));
        }
        Ok(())
    }

    /// Number of rows changed by the most recent statement.
    pub fn changes(&self) -> DbResult<c_int> {
        let db = self.handle()?;
        // SAFETY: `db` is live.
        Ok(unsafe { sys::sqlite3_changes(db) })
    }

    /// Rowid of the most recent successful INSERT.
    pub fn last_insert_rowid(&self) -> DbResult<i64> {
        let db = self.handle()?;
        // SAFETY: `db` is live.
        Ok(unsafe { sys::sqlite3_last_insert_rowid(db) })
    }

    // ── Statement operations ────────────────────────────────────────────

    /// Advances the statement. Returns `SQLITE_ROW` or `SQLITE_DONE`.
    pub fn step(&mut self, stmt: StmtPtr) -> DbResult<c_int> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        let rc = unsafe { sys::sqlite3_step(raw) };
        match rc {
            SQLITE_ROW | SQLITE_DONE => Ok(rc),
            _ => Err(self.last_error(rc)),
        }
    }

    /// Resets the statement so it can be stepped again.
    pub fn reset(&mut self, stmt: StmtPtr) -> DbResult<()> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        let rc = unsafe { sys::sqlite3_reset(raw) };
        self.check(rc)
    }

    /// Clears all parameter bindings.
    pub fn clear_bindings(&mut self, stmt: StmtPtr) -> DbResult<()> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        let rc = unsafe { sys::sqlite3_clear_bindings(raw) };
        self.check(rc)
    }

    /// Binds an integer to the 1-based parameter `idx`.
    pub fn bind_i64(&mut self, stmt: StmtPtr, idx: c_int, value: i64) -> DbResult<()> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        let rc = unsafe { sys::sqlite3_bind_int64(raw, idx, value) };
        self.check(rc)
    }

    /// Binds a double to the 1-based parameter `idx`.
    pub fn bind_f64(&mut self, stmt: StmtPtr, idx: c_int, value: f64) -> DbResult<()> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        let rc = unsafe { sys::sqlite3_bind_double(raw, idx, value) };
        self.check(rc)
    }

    /// Binds a blob (copied by `SQLite`) to the 1-based parameter `idx`.
    pub fn bind_blob(&mut self, stmt: StmtPtr, idx: c_int, value: &[u8]) -> DbResult<()> {
        let raw = self.stmt(stmt)?;
        let len = len_to_c_int(value.len())?;
        // SAFETY: `raw` is live; `value` is valid for `len` bytes and
        // SQLITE_TRANSIENT makes sqlite copy it before returning.
        let rc = unsafe {
            sys::sqlite3_bind_blob(raw, idx, value.as_ptr().cast(), len, sys::SQLITE_TRANSIENT())
        };
        self.check(rc)
    }

    /// Binds UTF-8 text (copied by `SQLite`) to the 1-based parameter `idx`.
    pub fn bind_text(&mut self, stmt: StmtPtr, idx: c_int, value: &str) -> DbResult<()> {
        let raw = self.stmt(stmt)?;
        let len = len_to_c_int(value.len())?;
        // SAFETY: `raw` is live; `value` is valid for `len` bytes and
        // SQLITE_TRANSIENT makes sqlite copy it before returning.
        let rc = unsafe {
            sys::sqlite3_bind_text(raw, idx, value.as_ptr().cast(), len, sys::SQLITE_TRANSIENT())
        };
        self.check(rc)
    }

    /// Binds SQL NULL to the 1-based parameter `idx`.
    pub fn bind_null(&mut self, stmt: StmtPtr, idx: c_int) -> DbResult<()> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        let rc = unsafe { sys::sqlite3_bind_null(raw, idx) };
        self.check(rc)
    }

    /// Number of SQL parameters in the statement.
    pub fn bind_parameter_count(&self, stmt: StmtPtr) -> DbResult<c_int> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        Ok(unsafe { sys::sqlite3_bind_parameter_count(raw) })
    }

    /// Number of columns in the result set.
    pub fn column_count(&self, stmt: StmtPtr) -> DbResult<c_int> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        Ok(unsafe { sys::sqlite3_column_count(raw) })
    }

    /// Storage class of column `col` in the current row.
    pub fn column_type(&self, stmt: StmtPtr, col: c_int) -> DbResult<c_int> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        Ok(unsafe { sys::sqlite3_column_type(raw, col) })
    }

    /// Reads column `col` as an integer.
    pub fn column_i64(&self, stmt: StmtPtr, col: c_int) -> DbResult<i64> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        Ok(unsafe { sys::sqlite3_column_int64(raw, col) })
    }

    /// Reads column `col` as a double.
    pub fn column_f64(&self, stmt: StmtPtr, col: c_int) -> DbResult<f64> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is a live statement of this handle.
        Ok(unsafe { sys::sqlite3_column_double(raw, col) })
    }

    /// Reads column `col` as bytes. NULL yields an empty vector.
    pub fn column_blob(&self, stmt: StmtPtr, col: c_int) -> DbResult<Vec<u8>> {
        let raw = self.stmt(stmt)?;
        // SAFETY: `raw` is live. The blob pointer stays valid until the next
        // step/reset/finalize, all of which need `&mut self`; it is copied
        // out immediately.
        unsafe {
            let data = sys::sqlite3_column_blob(raw, col);
            let len = sys::sqlite3_column_bytes(raw, col);
            Ok(copy_bytes(data.cast(), len))
        }
    }

    /// Reads column `col` as UTF-8 text. NULL yields an empty string.
    pub fn column_text(&self, stmt: StmtPtr, col: c_int) -> DbResult<String> {
        let raw = self.stmt(stmt)?;
        // SAFETY: as for `column_blob`; sqlite3_column_bytes is called after
        // sqlite3_column_text so the length matches the UTF-8 conversion.
        let bytes = unsafe {
            let data = sys::sqlite3_column_text(raw, col);
            let len = sys::sqlite3_column_bytes(raw, col);
            copy_bytes(data, len)
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn handle(&self) -> DbResult<*mut sys::sqlite3> {
        if self.db.is_null() {
            return Err(DbError::ConnectionClosed);
        }
        Ok(self.db)
    }

    fn stmt(&self, stmt: StmtPtr) -> DbResult<*mut sys::sqlite3_stmt> {
        self.handle()?;
        if !self.live.contains(&stmt) {
            return Err(not_owned(stmt));
        }
        Ok(to_raw(stmt))
    }

    fn check(&self, rc: c_int) -> DbResult<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.last_error(rc))
        }
    }

    fn last_error(&self, rc: c_int) -> DbError {
        DbError::native(rc, errmsg_raw(self.db))
    }
}

impl Drop for RawDb {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(%err, "failed to close sqlite handle");
        }
    }
}

fn to_raw(stmt: StmtPtr) -> *mut sys::sqlite3_stmt {
    ptr::with_exposed_provenance_mut(stmt.addr())
}

fn not_owned(stmt: StmtPtr) -> DbError {
    DbError::native(
        SQLITE_MISUSE,
        format!("statement {stmt} is not a live statement of this connection"),
    )
}

fn len_to_c_int(len: usize) -> DbResult<c_int> {
    c_int::try_from(len).map_err(|_| DbError::native(SQLITE_TOOBIG, "value too large to bind"))
}

/// Copies `len` bytes starting at `data`; null or non-positive length yields
/// an empty vector.
///
/// # Safety
///
/// When non-null, `data` must be valid for reads of `len` bytes.
unsafe fn copy_bytes(data: *const u8, len: c_int) -> Vec<u8> {
    let Ok(len) = usize::try_from(len) else {
        return Vec::new();
    };
    if data.is_null() || len == 0 {
        return Vec::new();
    }
    // SAFETY: guaranteed by the caller.
    unsafe { std::slice::from_raw_parts(data, len) }.to_vec()
}

fn errmsg_raw(db: *mut sys::sqlite3) -> String {
    if db.is_null() {
        return "connection is closed".to_string();
    }
    // SAFETY: `db` is a live handle; the message is copied immediately.
    unsafe {
        let msg = sys::sqlite3_errmsg(db);
        if msg.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}
