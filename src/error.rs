//! Typed failures that callers need to tell apart.
//!
//! Everything is still returned as `anyhow::Result`; use
//! `err.downcast_ref::<FolioError>()` to distinguish lock contention from
//! corruption or programmer errors.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FolioError {
    /// Lock acquisition did not finish within the configured timeout.
    #[error("lock timeout after {timeout:?} waiting for {what}")]
    LockTimeout { what: String, timeout: Duration },

    /// Page bytes failed CRC or header validation.
    #[error("invalid page at position {position_id}: {reason}")]
    InvalidPage { position_id: u32, reason: String },

    /// Internal invariant broken (allocation-map ownership, checkpoint planning...).
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Operation is not allowed in the current engine state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("short read at byte {position}: wanted {wanted} bytes")]
    ShortRead { position: u64, wanted: usize },
}

impl FolioError {
    pub fn is_lock_timeout(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<FolioError>(), Some(FolioError::LockTimeout { .. }))
    }
}
