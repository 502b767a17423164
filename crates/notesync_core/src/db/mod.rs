//! SQLite bootstrap for the local note cache.
//!
//! # Responsibility
//! - Open and configure SQLite connections backing the local store.
//! - Apply schema migrations in deterministic order.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - No note is read or written before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Failure opening or migrating the note cache.
#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// The cache was written by a newer build than this one.
    SchemaTooNew { found: u32, supported: u32 },
    /// A registered migration failed; its changes were rolled back.
    Migration {
        version: u32,
        source: rusqlite::Error,
    },
}

impl DbError {
    /// Stable identifier for `error_code=` log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "db_sqlite",
            Self::SchemaTooNew { .. } => "db_schema_too_new",
            Self::Migration { .. } => "db_migration_failed",
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "note cache: {err}"),
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "note cache schema v{found} comes from a newer notesync (this build reads up to v{supported})"
            ),
            Self::Migration { version, source } => {
                write!(f, "note cache migration v{version} failed: {source}")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::Migration { source: err, .. } => Some(err),
            Self::SchemaTooNew { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
