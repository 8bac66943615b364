//! Terraform remote-state storage for nahcloud.
//!
//! This crate provides the storage layer behind the HTTP state backend: the
//! `KvBackend` persistence trait with an in-memory (`MemoryKv`) and a
//! file-backed (`FileKv`) provider, the `LockRecord` wire type, and
//! `StateStore`, which keeps one opaque state blob and at most one lock
//! record per state id and serializes every operation on the same id.

mod keyed;
pub mod kv;
pub mod lock;
pub mod state;

pub use kv::{FileKv, KvBackend, MemoryKv};
pub use lock::{LockRecord, UnlockRequest};
pub use state::{validate_state_id, AcquireOutcome, ReleaseOutcome, StateStore};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` or `link()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid state id '{id}': {reason}")]
    InvalidStateId { id: String, reason: String },
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("data directory {0} is in use by another process")]
    DataDirLocked(String),
}
