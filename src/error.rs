//! Crate-wide error type.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum HtError {
    /// A digest-store or user-store failure, propagated unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A peer could not be reached or answered with an error. The local
    /// side is left untouched; the caller may retry the whole operation.
    #[error("remote peer error: {0}")]
    Remote(String),

    /// Invalid construction parameters. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A deferred write was submitted while the engine is not started.
    #[error("engine is not accepting writes")]
    Stopped,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
