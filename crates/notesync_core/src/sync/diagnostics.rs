//! Observable channel for background sync failures and merges.
//!
//! Remote failures never reach the caller of `save_synced` or a note
//! subscriber; they are logged and published here for retry-policy tuning.

use crate::model::note::NoteVersion;
use crate::remote::RemoteError;
use tokio::sync::broadcast;

const DIAGNOSTIC_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDiagnostic {
    RemoteFetchFailed {
        title: String,
        error: RemoteError,
    },
    RemoteStoreFailed {
        title: String,
        version: NoteVersion,
        error: RemoteError,
    },
    RemoteStored {
        title: String,
        version: NoteVersion,
    },
    /// A newer local version existed by the push's turn; it was not sent.
    PushSuperseded {
        title: String,
        version: NoteVersion,
    },
    RemoteApplied {
        title: String,
        version: NoteVersion,
    },
    LocalStoreFailed {
        title: String,
        message: String,
    },
    /// A fetch finished after its poller was released; result dropped.
    PollDiscarded {
        title: String,
    },
}

impl SyncDiagnostic {
    pub fn title(&self) -> &str {
        match self {
            Self::RemoteFetchFailed { title, .. }
            | Self::RemoteStoreFailed { title, .. }
            | Self::RemoteStored { title, .. }
            | Self::PushSuperseded { title, .. }
            | Self::RemoteApplied { title, .. }
            | Self::LocalStoreFailed { title, .. }
            | Self::PollDiscarded { title } => title,
        }
    }
}

pub(crate) struct DiagnosticsHub {
    sender: broadcast::Sender<SyncDiagnostic>,
}

impl DiagnosticsHub {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(DIAGNOSTIC_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub(crate) fn publish(&self, diagnostic: SyncDiagnostic) {
        let _ = self.sender.send(diagnostic);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncDiagnostic> {
        self.sender.subscribe()
    }
}
