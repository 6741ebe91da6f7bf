//! Thread-safe `SQLite` statement handles over a single shared connection.
//!
//! A [`Connection`] owns one native database handle behind a mutex and is
//! the only path to it ([`Connection::use_db`]). A [`SafeStatement`] wraps
//! one native statement pointer of that connection:
//!
//! * every native call made with the pointer runs under the connection lock,
//!   so statements sharing a connection never touch the engine at the same
//!   time;
//! * [`SafeStatement::close`] finalizes the pointer at most once, no matter
//!   how many threads ask, and replays the first outcome afterwards.
//!
//! The native boundary is the [`NativeDb`] trait. [`SqliteDb`] implements it
//! on top of the `SQLite` C library (bundled through `libsqlite3-sys`). The
//! `ffi` module is the **only** file that contains `unsafe` code or C types.

mod ffi;

pub mod config;
mod connection;
pub mod error;
mod native;
mod sqlite;
mod statement;
pub mod value;

pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{DbError, DbErrorCode, DbResult, NativeError};
pub use native::{NativeDb, StmtPtr};
pub use sqlite::{Row, SqliteDb, StepResult};
pub use statement::SafeStatement;
pub use value::{ColumnType, Value};

#[cfg(test)]
mod mock;
#[cfg(test)]
mod tests;
