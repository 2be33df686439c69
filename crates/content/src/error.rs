//! Error types for the content engine.

use blobmount_remote::RemoteError;
use thiserror::Error;

/// Errors from content engine operations.
#[derive(Debug, Error)]
pub enum ContentError {
    /// The read lease backing this operation has been revoked.
    #[error("lease revoked")]
    Revoked,

    /// A chunk is larger than the leaser's byte limit and can never be
    /// cached.
    #[error("content of {size} bytes exceeds the cache limit of {limit} bytes")]
    TooLarge {
        /// Size that was requested.
        size: u64,
        /// The leaser's byte limit.
        limit: u64,
    },

    /// A seek resolved to a position before the start of the content.
    #[error("invalid offset: {0}")]
    InvalidOffset(i64),

    /// Scratch file I/O failed. The owning content may have lost data and
    /// should be destroyed and reconstructed.
    #[error("scratch IO: {0}")]
    ScratchIo(#[from] std::io::Error),

    /// A remote operation failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The operation violates the object's usage contract.
    #[error("usage error: {0}")]
    Usage(&'static str),
}

impl ContentError {
    /// True if this is a revoked-lease error.
    pub fn is_revoked(&self) -> bool {
        matches!(self, ContentError::Revoked)
    }

    /// True if the underlying cause is a remote not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContentError::Remote(e) if e.is_not_found())
    }

    /// True if the underlying cause is a remote precondition failure.
    pub fn is_precondition(&self) -> bool {
        matches!(self, ContentError::Remote(e) if e.is_precondition())
    }
}
