//! Note synchronization engine.
//!
//! # Responsibility
//! - Compose the local cache, the remote service and per-title pollers into
//!   one continuously updated view per note.
//! - Apply the version merge policy to every remote snapshot.
//! - Push local saves to the remote without delaying local visibility.
//!
//! # Invariants
//! - Subscribers read only from the local change feed; remote results reach
//!   them by being merged into the local store.
//! - Merges and local saves for one title are serialized by the title lock.
//! - A local save increments the version exactly once.
//! - A merge never writes a remote copy whose version is not strictly greater
//!   than the local one.
//! - Pushes for one title run one at a time, oldest first, and a push whose
//!   note is no longer the latest local version is dropped.

use crate::config::SyncConfig;
use crate::model::note::{validate_title, Note, NoteValidationError, NoteVersion};
use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use crate::store::{LocalStore, NoteListStream, NoteStream, StoreError, StoreResult};
use crate::sync::diagnostics::{DiagnosticsHub, SyncDiagnostic};
use crate::sync::merge::{resolve, MergeDecision, MergeOutcome};
use crate::sync::poller_registry::{PollTask, PollerHandle, PollerRegistry, PollerRegistryError};
use crate::sync::title_lock::TitleLocks;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug)]
pub enum SyncError {
    Validation(NoteValidationError),
    Store(StoreError),
    Remote(RemoteError),
    Poller(PollerRegistryError),
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "local store failure: {err}"),
            Self::Remote(err) => write!(f, "{err}"),
            Self::Poller(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Remote(err) => Some(err),
            Self::Poller(err) => Some(err),
        }
    }
}

impl From<NoteValidationError> for SyncError {
    fn from(value: NoteValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Validation(err) => Self::Validation(err),
            other => Self::Store(other),
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(value: RemoteError) -> Self {
        Self::Remote(value)
    }
}

impl From<PollerRegistryError> for SyncError {
    fn from(value: PollerRegistryError) -> Self {
        match value {
            PollerRegistryError::InvalidTitle(err) => Self::Validation(err),
            other => Self::Poller(other),
        }
    }
}

/// State shared by the engine facade and every poller task.
struct SyncCore {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    locks: Arc<TitleLocks>,
    diagnostics: DiagnosticsHub,
    config: SyncConfig,
}

impl SyncCore {
    async fn fetch_remote(&self, title: &str) -> RemoteResult<Option<Note>> {
        let timeout = self.config.request_timeout();
        tokio::time::timeout(timeout, self.remote.fetch_note(title))
            .await
            .map_err(|_| RemoteError::Timeout(timeout))?
    }

    /// Runs the merge for one remote snapshot under the title lock.
    ///
    /// With `cancel` set, a cancelled poller's result is discarded instead of
    /// applied.
    fn merge(
        &self,
        title: &str,
        remote: Option<Note>,
        cancel: Option<&CancellationToken>,
    ) -> StoreResult<MergeOutcome> {
        let state = self.locks.get(title);
        let mut state = state.lock();
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Ok(MergeOutcome::Discarded);
        }

        let remote = match remote {
            Some(remote) if remote.title != title => {
                warn!("event=merge_apply module=sync status=skipped reason=title_mismatch");
                return Ok(MergeOutcome::TitleMismatch {
                    remote_title: remote.title,
                });
            }
            Some(remote) => remote,
            None => return Ok(MergeOutcome::NoRemote),
        };
        state.observe_remote(remote.version);

        let local = self.local.get(title)?;
        match resolve(local.as_ref(), Some(&remote)) {
            MergeDecision::NoRemote => Ok(MergeOutcome::NoRemote),
            MergeDecision::Converged => Ok(MergeOutcome::Converged),
            MergeDecision::StaleRemote => Ok(MergeOutcome::StaleRemote {
                local_version: local.map_or(0, |note| note.version),
                remote_version: remote.version,
            }),
            MergeDecision::ApplyRemote => {
                let stored = self.local.upsert(&remote, false)?;
                info!(
                    "event=merge_apply module=sync status=ok from_version={:?} to_version={}",
                    local.map(|note| note.version),
                    stored.version
                );
                self.diagnostics.publish(SyncDiagnostic::RemoteApplied {
                    title: title.to_string(),
                    version: stored.version,
                });
                Ok(MergeOutcome::Applied(stored))
            }
        }
    }

    /// Sends `note` once every earlier push for its title has finished.
    ///
    /// Skipped when the local copy has moved past `note` by then; whatever
    /// replaced it is pushed by its own save, or came from the remote.
    async fn push(&self, note: Note) {
        let gate = self.locks.push_gate(&note.title);
        let _turn = gate.lock().await;

        match self.local.get(&note.title) {
            Ok(Some(latest)) if latest.version > note.version => {
                debug!(
                    "event=remote_store module=sync status=superseded version={} latest_version={}",
                    note.version, latest.version
                );
                self.diagnostics.publish(SyncDiagnostic::PushSuperseded {
                    title: note.title,
                    version: note.version,
                });
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("event=remote_store module=sync status=unchecked error={err}");
            }
        }

        let timeout = self.config.request_timeout();
        let result = match tokio::time::timeout(timeout, self.remote.store_note(&note)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                debug!(
                    "event=remote_store module=sync status=ok version={}",
                    note.version
                );
                self.diagnostics.publish(SyncDiagnostic::RemoteStored {
                    title: note.title,
                    version: note.version,
                });
            }
            Err(err) => {
                warn!(
                    "event=remote_store module=sync status=error version={} error_code={} error={}",
                    note.version,
                    err.code(),
                    err
                );
                self.diagnostics.publish(SyncDiagnostic::RemoteStoreFailed {
                    title: note.title,
                    version: note.version,
                    error: err,
                });
            }
        }
    }
}

#[async_trait]
impl PollTask for SyncCore {
    async fn poll(&self, title: &str, cancel: &CancellationToken) {
        let remote = match self.fetch_remote(title).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(
                    "event=remote_fetch module=sync status=error error_code={} error={}",
                    err.code(),
                    err
                );
                self.diagnostics.publish(SyncDiagnostic::RemoteFetchFailed {
                    title: title.to_string(),
                    error: err,
                });
                return;
            }
        };

        match self.merge(title, remote, Some(cancel)) {
            Ok(MergeOutcome::Discarded) => {
                debug!("event=merge_apply module=sync status=discarded reason=poller_cancelled");
                self.diagnostics.publish(SyncDiagnostic::PollDiscarded {
                    title: title.to_string(),
                });
            }
            Ok(_) => {}
            Err(err) => {
                error!("event=merge_apply module=sync status=error error={err}");
                self.diagnostics.publish(SyncDiagnostic::LocalStoreFailed {
                    title: title.to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Live view of one note, kept fresh by local writes and remote polling.
///
/// Holding it keeps the title's poller alive; dropping it releases it.
pub struct SyncedNote {
    stream: NoteStream,
    poller: PollerHandle,
}

impl SyncedNote {
    pub fn title(&self) -> &str {
        self.stream.title()
    }

    /// Waits for the next value; the first call yields the current one.
    pub async fn next(&mut self) -> Option<Option<Note>> {
        self.stream.next().await
    }

    /// Returns a pending value without waiting.
    pub fn try_next(&mut self) -> Option<Option<Note>> {
        self.stream.try_next()
    }

    /// Reads the current local value.
    pub fn current(&self) -> SyncResult<Option<Note>> {
        Ok(self.stream.current()?)
    }

    pub fn poller_id(&self) -> u64 {
        self.poller.poller_id()
    }
}

/// Entry point composing stores and pollers.
pub struct SyncEngine {
    core: Arc<SyncCore>,
    registry: PollerRegistry,
}

impl SyncEngine {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Self {
        let locks = Arc::new(TitleLocks::new());
        let interval = config.poll_interval();
        let core = Arc::new(SyncCore {
            local,
            remote,
            locks: Arc::clone(&locks),
            diagnostics: DiagnosticsHub::new(),
            config,
        });
        let registry = PollerRegistry::new(core.clone(), interval, locks);
        Self { core, registry }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.core.config
    }

    /// Subscribes to `title`, starting its poller if needed.
    pub fn get_synced(&self, title: &str) -> SyncResult<SyncedNote> {
        validate_title(title)?;
        let stream = NoteStream::open(Arc::clone(&self.core.local), title)?;
        let poller = self.registry.acquire(title)?;
        Ok(SyncedNote { stream, poller })
    }

    /// Saves locally with a version bump, then pushes the stored note in the
    /// background.
    ///
    /// Returns as soon as the local write commits. Remote failures are only
    /// reported through [`SyncEngine::diagnostics`].
    pub fn save_synced(&self, note: &Note) -> SyncResult<Note> {
        note.validate()?;
        let stored = {
            let state = self.core.locks.get(&note.title);
            let _guard = state.lock();
            self.core.local.upsert(note, true)?
        };

        match Handle::try_current() {
            Ok(runtime) => {
                let core = Arc::clone(&self.core);
                let pushed = stored.clone();
                runtime.spawn(async move { core.push(pushed).await });
            }
            Err(_) => {
                warn!("event=remote_store module=sync status=skipped reason=no_runtime");
                self.core
                    .diagnostics
                    .publish(SyncDiagnostic::RemoteStoreFailed {
                        title: stored.title.clone(),
                        version: stored.version,
                        error: RemoteError::Unavailable("no async runtime".to_string()),
                    });
            }
        }

        Ok(stored)
    }

    /// Returns the local note, inserting an empty version-0 note when absent.
    pub fn get_or_create(&self, title: &str) -> SyncResult<Note> {
        validate_title(title)?;
        let state = self.core.locks.get(title);
        let _guard = state.lock();
        if let Some(existing) = self.core.local.get(title)? {
            return Ok(existing);
        }
        Ok(self.core.local.upsert(&Note::placeholder(title), false)?)
    }

    /// Deletes the local copy only; the remote copy is untouched.
    pub fn delete(&self, note: &Note) -> SyncResult<bool> {
        note.validate()?;
        let state = self.core.locks.get(&note.title);
        let _guard = state.lock();
        Ok(self.core.local.delete(note)?)
    }

    pub fn exists(&self, title: &str) -> SyncResult<bool> {
        Ok(self.core.local.exists(title)?)
    }

    pub fn get_local(&self, title: &str) -> SyncResult<Option<Note>> {
        Ok(self.core.local.get(title)?)
    }

    /// Lists local notes ordered by title.
    pub fn list(&self) -> SyncResult<Vec<Note>> {
        Ok(self.core.local.get_all()?)
    }

    pub fn watch_all(&self) -> SyncResult<NoteListStream> {
        Ok(NoteListStream::open(Arc::clone(&self.core.local))?)
    }

    /// Applies one remote snapshot for `title` to the local store.
    pub fn merge_remote(&self, title: &str, remote: Option<Note>) -> SyncResult<MergeOutcome> {
        validate_title(title)?;
        Ok(self.core.merge(title, remote, None)?)
    }

    /// Fetches and merges once, outside the poll schedule.
    pub async fn poll_once(&self, title: &str) -> SyncResult<MergeOutcome> {
        validate_title(title)?;
        let remote = self.core.fetch_remote(title).await?;
        Ok(self.core.merge(title, remote, None)?)
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<SyncDiagnostic> {
        self.core.diagnostics.subscribe()
    }

    pub fn active_pollers(&self) -> usize {
        self.registry.active_count()
    }

    pub fn subscriber_count(&self, title: &str) -> usize {
        self.registry.ref_count(title)
    }

    pub fn last_remote_version(&self, title: &str) -> Option<NoteVersion> {
        self.core.locks.last_remote_version(title)
    }
}
