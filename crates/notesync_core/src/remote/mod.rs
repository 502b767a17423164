//! Remote note service contract.
//!
//! # Responsibility
//! - Define the fetch/store contract the sync engine polls and pushes through.
//! - Classify remote failures so callers can log and retry uniformly.
//!
//! # Invariants
//! - A title unknown to the service is `Ok(None)`, never an error.
//! - Implementations never block the calling thread; all I/O is async.

use crate::model::note::Note;
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub mod http_store;
pub mod memory_store;

pub use http_store::HttpRemoteStore;
pub use memory_store::MemoryRemoteStore;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Remote call failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure or non-success status.
    Unavailable(String),
    /// Call exceeded its deadline.
    Timeout(Duration),
    /// Response could not be decoded into a note.
    Malformed(String),
    /// Base URL cannot address the notes endpoint.
    InvalidEndpoint(String),
}

impl RemoteError {
    /// Stable code used in log lines and diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "remote_unavailable",
            Self::Timeout(_) => "remote_timeout",
            Self::Malformed(_) => "malformed_remote_data",
            Self::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "remote service unavailable: {message}"),
            Self::Timeout(after) => {
                write!(f, "remote call timed out after {}ms", after.as_millis())
            }
            Self::Malformed(message) => write!(f, "malformed remote note: {message}"),
            Self::InvalidEndpoint(url) => write!(f, "invalid remote endpoint: {url}"),
        }
    }
}

impl Error for RemoteError {}

/// Network-facing note service.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches the remote copy of `title`.
    async fn fetch_note(&self, title: &str) -> RemoteResult<Option<Note>>;
    /// Stores `note` remotely, replacing any copy with the same title.
    async fn store_note(&self, note: &Note) -> RemoteResult<()>;
}
