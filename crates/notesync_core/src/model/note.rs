//! Note domain model.
//!
//! # Responsibility
//! - Define the record synchronized between the local cache and the remote service.
//! - Provide version comparison helpers used by the merge policy.
//!
//! # Invariants
//! - `title` is non-empty after trimming and acts as the primary key.
//! - A freshly created note has version 0, so any existing remote copy wins.
//! - Higher `version` is authoritative; equal versions are converged.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Monotonic ordering key for copies of the same note.
pub type NoteVersion = u64;

/// Validation errors for note invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteValidationError {
    /// Title is empty or whitespace only.
    EmptyTitle,
}

impl Display for NoteValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTitle => write!(f, "note title must not be empty"),
        }
    }
}

impl Error for NoteValidationError {}

/// A named text document kept in sync across clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Unique key in both the local and the remote store.
    pub title: String,
    /// Free-form text body.
    pub content: String,
    /// Bumped by exactly one on every local save.
    pub version: NoteVersion,
}

impl Note {
    /// Creates a note at version 0.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_version(title, content, 0)
    }

    /// Creates a note carrying an already-known version.
    ///
    /// Used when decoding remote snapshots, which are authoritative as-is.
    pub fn with_version(
        title: impl Into<String>,
        content: impl Into<String>,
        version: NoteVersion,
    ) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            version,
        }
    }

    /// Returns the empty placeholder inserted for titles unknown locally.
    pub fn placeholder(title: impl Into<String>) -> Self {
        Self::new(title, "")
    }

    /// Validates invariants before persistence.
    pub fn validate(&self) -> Result<(), NoteValidationError> {
        validate_title(&self.title)
    }

    /// Returns whether `self` strictly supersedes `other`.
    pub fn is_newer_than(&self, other: &Note) -> bool {
        self.compare_version(other) == Ordering::Greater
    }

    /// Compares two copies by version only.
    pub fn compare_version(&self, other: &Note) -> Ordering {
        self.version.cmp(&other.version)
    }
}

/// Validates a title used as a lookup key.
pub fn validate_title(title: &str) -> Result<(), NoteValidationError> {
    if title.trim().is_empty() {
        return Err(NoteValidationError::EmptyTitle);
    }
    Ok(())
}
