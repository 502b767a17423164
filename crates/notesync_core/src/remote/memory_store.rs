//! In-process stand-in for the notes service.
//!
//! Simulates edits made by another client, injected failures and slow
//! fetches. Used by the engine tests and by `notesync --offline`.

use crate::model::note::Note;
use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Default)]
struct MemoryRemoteState {
    notes: HashMap<String, Note>,
    fetch_error: Option<RemoteError>,
    store_error: Option<RemoteError>,
    fetch_delay: Option<Duration>,
    fetch_calls: HashMap<String, usize>,
    stored: Vec<Note>,
}

/// Remote store holding notes in a map.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<MemoryRemoteState>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the remote copy, as if another client had saved it.
    pub fn put_remote(&self, note: Note) {
        self.state.lock().notes.insert(note.title.clone(), note);
    }

    /// Removes the remote copy.
    pub fn remove_remote(&self, title: &str) {
        self.state.lock().notes.remove(title);
    }

    pub fn remote_note(&self, title: &str) -> Option<Note> {
        self.state.lock().notes.get(title).cloned()
    }

    /// Makes every fetch fail with `error` until cleared with `None`.
    pub fn set_fetch_error(&self, error: Option<RemoteError>) {
        self.state.lock().fetch_error = error;
    }

    /// Makes every store fail with `error` until cleared with `None`.
    pub fn set_store_error(&self, error: Option<RemoteError>) {
        self.state.lock().store_error = error;
    }

    /// Delays every fetch by `delay` before the snapshot is taken.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state.lock().fetch_delay = delay;
    }

    /// Number of fetches issued for `title`.
    pub fn fetch_count(&self, title: &str) -> usize {
        self.state
            .lock()
            .fetch_calls
            .get(title)
            .copied()
            .unwrap_or(0)
    }

    /// Notes accepted by `store_note`, in call order.
    pub fn stored_notes(&self) -> Vec<Note> {
        self.state.lock().stored.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch_note(&self, title: &str) -> RemoteResult<Option<Note>> {
        let delay = {
            let mut state = self.state.lock();
            *state.fetch_calls.entry(title.to_string()).or_insert(0) += 1;
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if let Some(err) = state.fetch_error.clone() {
            return Err(err);
        }
        Ok(state.notes.get(title).cloned())
    }

    async fn store_note(&self, note: &Note) -> RemoteResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.store_error.clone() {
            return Err(err);
        }
        state.notes.insert(note.title.clone(), note.clone());
        state.stored.push(note.clone());
        Ok(())
    }
}
