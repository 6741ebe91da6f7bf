//! Database error types for the safe `SQLite` wrapper.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result code reported by the native engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbErrorCode(pub i32);

impl fmt::Display for DbErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A failure raised by the native engine.
#[derive(Debug, PartialEq, Eq, Error)]
#[error("sqlite error {code}: {message}")]
pub struct NativeError {
    /// `SQLite` result code.
    pub code: DbErrorCode,
    /// Human-readable error message (from `sqlite3_errmsg` when available).
    pub message: String,
}

/// Error returned by database operations.
///
/// Cloning a [`DbError::Native`] shares the underlying [`NativeError`], so a
/// failure cached by [`SafeStatement::close`](crate::SafeStatement::close)
/// is handed back as the same object on every replay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The statement pointer has already been closed.
    #[error("the statement pointer is closed")]
    AlreadyClosed,

    /// The connection has been torn down.
    #[error("the connection is closed")]
    ConnectionClosed,

    /// A unit of work panicked while holding the connection lock.
    #[error("connection lock poisoned")]
    LockPoisoned,

    /// Failure reported by the native engine.
    #[error(transparent)]
    Native(Arc<NativeError>),
}

impl DbError {
    /// Creates a native failure with the given result code and message.
    pub fn native(code: i32, message: impl Into<String>) -> Self {
        Self::Native(Arc::new(NativeError {
            code: DbErrorCode(code),
            message: message.into(),
        }))
    }

    /// Returns the native result code, if this is a native failure.
    #[must_use]
    pub fn code(&self) -> Option<DbErrorCode> {
        match self {
            Self::Native(err) => Some(err.code),
            _ => None,
        }
    }

    /// Returns `true` if both errors are the very same captured failure,
    /// not merely equal ones.
    #[must_use]
    pub fn is_same_failure(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Native(a), Self::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
