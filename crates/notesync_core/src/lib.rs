//! Core note synchronization for notesync.
//! Keeps a local note cache converged with a shared remote notes service.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::{ConfigError, SyncConfig};
pub use logging::{default_log_level, init_logging, init_logging_from_config, logging_status};
pub use model::note::{Note, NoteValidationError, NoteVersion};
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteError, RemoteResult, RemoteStore};
pub use store::{
    LocalStore, NoteListStream, NoteStream, SqliteNoteStore, StoreError, StoreEvent, StoreResult,
};
pub use sync::diagnostics::SyncDiagnostic;
pub use sync::engine::{SyncEngine, SyncError, SyncResult, SyncedNote};
pub use sync::merge::{MergeDecision, MergeOutcome};
pub use sync::poller_registry::{PollTask, PollerHandle, PollerRegistry, PollerRegistryError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
