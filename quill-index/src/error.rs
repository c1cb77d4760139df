//! Error types of the index engine.

use crate::backend::BackendError;
use crate::chain::ChainError;

/// The error type of every engine operation.
///
/// The write path surfaces only `Corruption`, `ReindexRequired`, `Backend`
/// and `Store`; `NotFound` and `Invalid` belong to the query path.
/// `Inconsistent` is logged and answered best-effort at query time but is
/// fatal during startup verification.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The requested address, transaction or block is not indexed.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself is malformed (bad address, out of range index).
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A cross-column invariant failed; carries the identifying key.
    #[error("DB inconsistency: {0}")]
    Inconsistent(String),

    /// The backend RPC failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A packed record was truncated or malformed. Fatal: the store cannot
    /// be trusted past this point.
    #[error("corrupt record: {0}")]
    Corruption(String),

    /// A disconnect was requested past the retained undo history.
    #[error(
        "cannot disconnect blocks at height {0} and lower, it is necessary to rebuild the index"
    )]
    ReindexRequired(u32),

    /// The read operation was cancelled by its caller.
    #[error("operation aborted")]
    Aborted,

    /// The underlying KV store failed.
    #[error("store error: {0}")]
    Store(#[from] lmdb::Error),

    /// Filesystem level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The chain model rejected data it was given.
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
}

impl IndexError {
    /// A corruption error tagged with the operation and the hex of the
    /// offending key.
    pub(crate) fn corrupt(op: &str, key: &[u8], err: impl std::fmt::Display) -> Self {
        IndexError::Corruption(format!("{op} key={}: {err}", hex::encode(key)))
    }
}
