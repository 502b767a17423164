//! Reference-counted registry of per-title background pollers.
//!
//! # Responsibility
//! - Start one periodic poll task per observed title and share it between
//!   subscribers.
//! - Stop the task when the last subscriber releases it.
//!
//! # Invariants
//! - At most one active poller per title.
//! - A poller's token is cancelled while holding the title lock, so once
//!   `release` returns no merge of that poller can still be applied.
//! - Cancelling one title never touches another title's poller.

use crate::model::note::{validate_title, NoteValidationError};
use crate::sync::title_lock::TitleLocks;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Work performed on every poll tick.
#[async_trait]
pub trait PollTask: Send + Sync + 'static {
    /// Runs one tick for `title`.
    ///
    /// Implementations must re-check `cancel` under the title lock before
    /// applying any result.
    async fn poll(&self, title: &str, cancel: &CancellationToken);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerRegistryError {
    InvalidTitle(NoteValidationError),
    /// `acquire` was called outside a tokio runtime.
    NoRuntime,
}

impl Display for PollerRegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTitle(err) => write!(f, "{err}"),
            Self::NoRuntime => write!(f, "pollers require a running tokio runtime"),
        }
    }
}

impl Error for PollerRegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidTitle(err) => Some(err),
            Self::NoRuntime => None,
        }
    }
}

struct PollerEntry {
    poller_id: u64,
    ref_count: usize,
    cancel: CancellationToken,
}

struct RegistryInner {
    task: Arc<dyn PollTask>,
    interval: Duration,
    locks: Arc<TitleLocks>,
    pollers: Mutex<HashMap<String, PollerEntry>>,
    next_poller_id: AtomicU64,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for entry in self.pollers.get_mut().values() {
            entry.cancel.cancel();
        }
    }
}

/// Registry of active pollers, keyed by title.
pub struct PollerRegistry {
    inner: Arc<RegistryInner>,
}

/// Subscriber's reference to a shared poller; releases on drop.
#[must_use = "dropping the handle releases the poller immediately"]
pub struct PollerHandle {
    title: String,
    poller_id: u64,
    registry: Weak<RegistryInner>,
    released: bool,
}

impl PollerHandle {
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn poller_id(&self) -> u64 {
        self.poller_id
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(inner) = self.registry.upgrade() {
            release_entry(&inner, &self.title, self.poller_id);
        }
    }
}

impl PollerRegistry {
    pub fn new(task: Arc<dyn PollTask>, interval: Duration, locks: Arc<TitleLocks>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                task,
                interval,
                locks,
                pollers: Mutex::new(HashMap::new()),
                next_poller_id: AtomicU64::new(1),
            }),
        }
    }

    /// Joins the poller for `title`, starting it if none is running.
    pub fn acquire(&self, title: &str) -> Result<PollerHandle, PollerRegistryError> {
        validate_title(title).map_err(PollerRegistryError::InvalidTitle)?;
        let runtime = Handle::try_current().map_err(|_| PollerRegistryError::NoRuntime)?;

        let mut pollers = self.inner.pollers.lock();
        if let Some(entry) = pollers.get_mut(title) {
            entry.ref_count += 1;
            debug!(
                "event=poller_acquire module=sync status=shared poller_id={} ref_count={}",
                entry.poller_id, entry.ref_count
            );
            return Ok(self.handle(title, entry.poller_id));
        }

        let poller_id = self.inner.next_poller_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        runtime.spawn(run_poller(
            Arc::clone(&self.inner.task),
            title.to_string(),
            self.inner.interval,
            cancel.clone(),
            poller_id,
        ));
        pollers.insert(
            title.to_string(),
            PollerEntry {
                poller_id,
                ref_count: 1,
                cancel,
            },
        );
        Ok(self.handle(title, poller_id))
    }

    /// Drops one reference; the poller stops when none remain.
    pub fn release(&self, handle: PollerHandle) {
        drop(handle);
    }

    pub fn active_count(&self) -> usize {
        self.inner.pollers.lock().len()
    }

    pub fn is_active(&self, title: &str) -> bool {
        self.inner.pollers.lock().contains_key(title)
    }

    /// Current subscriber count for `title`; zero when no poller runs.
    pub fn ref_count(&self, title: &str) -> usize {
        self.inner
            .pollers
            .lock()
            .get(title)
            .map_or(0, |entry| entry.ref_count)
    }

    fn handle(&self, title: &str, poller_id: u64) -> PollerHandle {
        PollerHandle {
            title: title.to_string(),
            poller_id,
            registry: Arc::downgrade(&self.inner),
            released: false,
        }
    }
}

fn release_entry(inner: &RegistryInner, title: &str, poller_id: u64) {
    let stopped = {
        let mut pollers = inner.pollers.lock();
        let Some(entry) = pollers.get_mut(title) else {
            return;
        };
        if entry.poller_id != poller_id {
            return;
        }
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            debug!(
                "event=poller_release module=sync status=shared poller_id={} ref_count={}",
                poller_id, entry.ref_count
            );
            return;
        }
        pollers.remove(title)
    };

    if let Some(entry) = stopped {
        let state = inner.locks.get(title);
        let _guard = state.lock();
        entry.cancel.cancel();
    }
}

async fn run_poller(
    task: Arc<dyn PollTask>,
    title: String,
    interval: Duration,
    cancel: CancellationToken,
    poller_id: u64,
) {
    info!(
        "event=poller_start module=sync status=ok poller_id={} interval_ms={}",
        poller_id,
        interval.as_millis()
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        task.poll(&title, &cancel).await;
    }

    info!("event=poller_stop module=sync status=ok poller_id={poller_id}");
}
