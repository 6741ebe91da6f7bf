//! The native boundary consumed by [`Connection`](crate::Connection).

use std::fmt;

use crate::error::DbResult;

/// Opaque native statement pointer value.
///
/// Only the address is kept; dereferencing is left to the backend that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtPtr(usize);

impl StmtPtr {
    /// Wraps a raw pointer address.
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw pointer address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Display for StmtPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A native database handle.
///
/// Implementations are only ever reached through
/// [`Connection::use_db`](crate::Connection::use_db), so every method runs
/// with the connection's lock held.
pub trait NativeDb: Send {
    /// Destroys the statement behind `stmt` and returns the engine's status
    /// code.
    ///
    /// The caller guarantees this is invoked at most once per pointer.
    ///
    /// # Errors
    ///
    /// Returns the failure reported by the engine.
    fn finalize(&mut self, stmt: StmtPtr) -> DbResult<i32>;

    /// Releases the database handle itself.
    ///
    /// # Errors
    ///
    /// Returns the failure reported by the engine.
    fn close(&mut self) -> DbResult<()>;
}
