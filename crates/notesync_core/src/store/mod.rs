//! Local note cache contract.
//!
//! # Responsibility
//! - Define the narrow storage contract consumed by the sync engine.
//! - Publish committed changes so observers never poll the cache.
//!
//! # Invariants
//! - Titles are unique; `upsert` replaces the record with the same title.
//! - Change events are published after commit, in write order.
//! - `upsert(.., true)` stores `max(existing, given) + 1`; `upsert(.., false)`
//!   stores the given version verbatim.

use crate::db::DbError;
use crate::model::note::{Note, NoteValidationError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::broadcast;

pub mod sqlite_store;
pub mod watch;

pub use sqlite_store::SqliteNoteStore;
pub use watch::{NoteListStream, NoteStream};

pub type StoreResult<T> = Result<T, StoreError>;

/// Local persistence failure surfaced to the caller of one operation.
#[derive(Debug)]
pub enum StoreError {
    Validation(NoteValidationError),
    Db(DbError),
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted note data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<NoteValidationError> for StoreError {
    fn from(value: NoteValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Committed change to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Record inserted or replaced; carries the stored row.
    Upserted(Note),
    /// Record removed.
    Deleted { title: String },
}

impl StoreEvent {
    pub fn title(&self) -> &str {
        match self {
            Self::Upserted(note) => note.title.as_str(),
            Self::Deleted { title } => title.as_str(),
        }
    }

    /// Value an observer of this title should see after the change.
    pub fn into_value(self) -> Option<Note> {
        match self {
            Self::Upserted(note) => Some(note),
            Self::Deleted { .. } => None,
        }
    }
}

/// Storage contract for the local note cache.
///
/// Calls are synchronous and expected to be short; implementations serialize
/// writes internally.
pub trait LocalStore: Send + Sync {
    /// Gets one note by title.
    fn get(&self, title: &str) -> StoreResult<Option<Note>>;
    /// Lists all notes ordered by title.
    fn get_all(&self) -> StoreResult<Vec<Note>>;
    /// Inserts or replaces the note and returns the stored row.
    fn upsert(&self, note: &Note, increment_version: bool) -> StoreResult<Note>;
    /// Deletes the note with `note.title`; returns whether a row was removed.
    fn delete(&self, note: &Note) -> StoreResult<bool>;
    /// Returns whether a note with this title exists.
    fn exists(&self, title: &str) -> StoreResult<bool>;
    /// Subscribes to committed changes.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
