//! Observable reads over the local store change feed.
//!
//! # Responsibility
//! - Turn one-shot `get`/`get_all` reads into streams that re-emit on change.
//!
//! # Invariants
//! - The first `next()` yields the current value.
//! - The receiver is subscribed before the initial read, so no commit between
//!   the two is lost.
//! - Every committed change to the watched title yields exactly one value.
//!   Only when the channel lags does the stream fall back to a fresh read.

use crate::model::note::Note;
use crate::store::{LocalStore, StoreEvent, StoreResult};
use log::warn;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;

/// Continuously updated view of one note.
pub struct NoteStream {
    title: String,
    store: Arc<dyn LocalStore>,
    events: Receiver<StoreEvent>,
    pending: VecDeque<Option<Note>>,
    closed: bool,
}

impl NoteStream {
    /// Subscribes to `title`, capturing the current value as the first item.
    pub fn open(store: Arc<dyn LocalStore>, title: impl Into<String>) -> StoreResult<Self> {
        let title = title.into();
        let events = store.subscribe();
        let initial = store.get(&title)?;
        Ok(Self {
            title,
            store,
            events,
            pending: VecDeque::from([initial]),
            closed: false,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Reads the current value without consuming stream items.
    pub fn current(&self) -> StoreResult<Option<Note>> {
        self.store.get(&self.title)
    }

    /// Waits for the next value.
    ///
    /// Returns `None` only when the store has been dropped.
    pub async fn next(&mut self) -> Option<Option<Note>> {
        if let Some(value) = self.pending.pop_front() {
            return Some(value);
        }
        if self.closed {
            return None;
        }

        loop {
            match self.events.recv().await {
                Ok(event) if event.title() == self.title => return Some(event.into_value()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event=note_stream_lagged module=store status=resync skipped={skipped}");
                    match self.store.get(&self.title) {
                        Ok(value) => return Some(value),
                        Err(err) => {
                            warn!("event=note_stream_resync module=store status=error error={err}");
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    /// Returns an already-delivered change without waiting, if any.
    pub fn try_next(&mut self) -> Option<Option<Note>> {
        if let Some(value) = self.pending.pop_front() {
            return Some(value);
        }
        loop {
            match self.events.try_recv() {
                Ok(event) if event.title() == self.title => return Some(event.into_value()),
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => {
                    return self.store.get(&self.title).ok();
                }
                Err(_) => return None,
            }
        }
    }
}

/// Continuously updated view of the whole collection, ordered by title.
pub struct NoteListStream {
    store: Arc<dyn LocalStore>,
    events: Receiver<StoreEvent>,
    pending: Option<Vec<Note>>,
}

impl NoteListStream {
    pub fn open(store: Arc<dyn LocalStore>) -> StoreResult<Self> {
        let events = store.subscribe();
        let initial = store.get_all()?;
        Ok(Self {
            store,
            events,
            pending: Some(initial),
        })
    }

    /// Waits for the next full listing.
    pub async fn next(&mut self) -> Option<StoreResult<Vec<Note>>> {
        if let Some(notes) = self.pending.take() {
            return Some(Ok(notes));
        }

        match self.events.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => {
                // Collapse a burst of changes into one listing.
                while self.events.try_recv().is_ok() {}
                Some(self.store.get_all())
            }
            Err(RecvError::Closed) => None,
        }
    }
}
