//! Domain model for synchronized notes.
//!
//! # Responsibility
//! - Define the canonical note record shared by local and remote stores.
//!
//! # Invariants
//! - Every note is identified by its title, in both stores.
//! - `version` is the only ordering key used for conflict resolution.

pub mod note;
