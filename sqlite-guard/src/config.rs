//! Connection configuration.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{DbError, DbResult};
use crate::ffi;

const JOURNAL_MODES: &[&str] = &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
const SYNCHRONOUS_MODES: &[&str] = &["OFF", "NORMAL", "FULL", "EXTRA"];

/// Options used by [`Connection::open_with`](crate::Connection::open_with).
///
/// Deserializable so it can be embedded in a larger configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Database file. `:memory:` opens a private in-memory database.
    pub path: PathBuf,
    /// Open without write access.
    pub read_only: bool,
    /// Retry a locked database for this many milliseconds before failing.
    pub busy_timeout_ms: Option<u32>,
    /// Enforce foreign key constraints.
    pub foreign_keys: bool,
    /// `PRAGMA journal_mode` value, e.g. `WAL`.
    pub journal_mode: Option<String>,
    /// `PRAGMA synchronous` value, e.g. `FULL`.
    pub synchronous: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            read_only: false,
            busy_timeout_ms: None,
            foreign_keys: true,
            journal_mode: None,
            synchronous: None,
        }
    }
}

impl ConnectionConfig {
    /// Default configuration for a database file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Builds the PRAGMA script applied right after opening.
    ///
    /// # Errors
    ///
    /// Returns `SQLITE_MISUSE` if a mode is not one the engine knows.
    pub fn pragmas(&self) -> DbResult<String> {
        let mut sql = String::new();
        let foreign_keys = if self.foreign_keys { "ON" } else { "OFF" };
        let _ = writeln!(sql, "PRAGMA foreign_keys = {foreign_keys};");
        if let Some(mode) = &self.journal_mode {
            let mode = checked_keyword("journal_mode", mode, JOURNAL_MODES)?;
            let _ = writeln!(sql, "PRAGMA journal_mode = {mode};");
        }
        if let Some(mode) = &self.synchronous {
            let mode = checked_keyword("synchronous", mode, SYNCHRONOUS_MODES)?;
            let _ = writeln!(sql, "PRAGMA synchronous = {mode};");
        }
        Ok(sql)
    }
}

fn checked_keyword(pragma: &str, value: &str, allowed: &[&str]) -> DbResult<String> {
    let upper = value.trim().to_ascii_uppercase();
    if allowed.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(DbError::native(
            ffi::SQLITE_MISUSE,
            format!("unsupported {pragma} value: {value:?}"),
        ))
    }
}
