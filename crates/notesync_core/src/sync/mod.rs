//! Local/remote note synchronization.
//!
//! # Responsibility
//! - Resolve conflicts between local and remote copies by version.
//! - Run at most one background poller per observed title.
//! - Expose one merged, continuously updated stream per note.

pub mod diagnostics;
pub mod engine;
pub mod merge;
pub mod poller_registry;
pub mod title_lock;
