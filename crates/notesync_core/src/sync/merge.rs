//! Version-based conflict resolution between local and remote copies.
//!
//! # Invariants
//! - The copy with the strictly greater version wins.
//! - Equal versions are converged; local is kept.
//! - Resolution is pure, so applying the same snapshot twice is a no-op the
//!   second time.

use crate::model::note::{Note, NoteVersion};

/// Decision for one remote snapshot against the current local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Remote has no copy; local stands.
    NoRemote,
    /// Local is absent or older; remote becomes the local value verbatim.
    ApplyRemote,
    /// Same version on both sides.
    Converged,
    /// Local is newer; the remote snapshot is stale.
    StaleRemote,
}

pub fn resolve(local: Option<&Note>, remote: Option<&Note>) -> MergeDecision {
    let Some(remote) = remote else {
        return MergeDecision::NoRemote;
    };
    match local {
        None => MergeDecision::ApplyRemote,
        Some(local) if remote.is_newer_than(local) => MergeDecision::ApplyRemote,
        Some(local) if local.version == remote.version => MergeDecision::Converged,
        Some(_) => MergeDecision::StaleRemote,
    }
}

/// What a merge actually did to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    NoRemote,
    /// Remote copy written locally; carries the stored note.
    Applied(Note),
    Converged,
    StaleRemote {
        local_version: NoteVersion,
        remote_version: NoteVersion,
    },
    /// Poller was cancelled before the result could be applied.
    Discarded,
    /// Snapshot belongs to another note; nothing was written.
    TitleMismatch { remote_title: String },
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}
