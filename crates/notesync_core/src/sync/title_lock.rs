//! Per-title mutable sync state.
//!
//! The poller's merge, local saves and poller cancellation for one title all
//! run under that title's lock. Holders must not await while locked.
//!
//! Remote pushes for one title take turns through a separate async gate, so a
//! slow PUT is never overtaken by a later one.

use crate::model::note::NoteVersion;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// State shared between the poller and local writers of one title.
#[derive(Debug, Default)]
pub struct TitleState {
    /// Highest remote version observed so far.
    pub last_remote_version: Option<NoteVersion>,
}

impl TitleState {
    pub fn observe_remote(&mut self, version: NoteVersion) {
        self.last_remote_version = Some(
            self.last_remote_version
                .map_or(version, |seen| seen.max(version)),
        );
    }
}

#[derive(Debug, Default)]
pub struct TitleLocks {
    entries: DashMap<String, Arc<Mutex<TitleState>>>,
    push_gates: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl TitleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `title`, creating it on first use.
    pub fn get(&self, title: &str) -> Arc<Mutex<TitleState>> {
        if let Some(existing) = self.entries.get(title) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.entries.entry(title.to_string()).or_default().value())
    }

    /// Returns the push gate for `title`; may be held across awaits.
    pub fn push_gate(&self, title: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.push_gates
                .entry(title.to_string())
                .or_default()
                .value(),
        )
    }

    pub fn last_remote_version(&self, title: &str) -> Option<NoteVersion> {
        let entry = self.entries.get(title)?;
        let state = entry.value().lock();
        state.last_remote_version
    }
}
